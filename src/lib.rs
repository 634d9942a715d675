// mvsgm: multi-view plane-sweep stereo with semi-global cost aggregation.
//
// Per reference-image tile the engines build a matching-cost volume over a
// list of fronto-parallel depth planes, fuse the costs of several target
// cameras into best / second-best volumes, optionally smooth the volume
// along 1-D sweeps (SGM), and extract a dense depth/similarity map.
//
// `Sgm` is the CPU reference; `gpu::GpuSgm` runs the same pipeline with
// wgpu compute kernels and is validated against it.

pub mod error;
pub mod config;
pub mod image;
pub mod camera;
pub mod tile;
pub mod depth_list;
pub mod memory;
pub mod cache;
pub mod cost;
pub mod volume;
pub mod similarity;
pub mod optimize;
pub mod retrieve;
pub mod export;
pub mod sgm;
pub mod synthetic;
pub mod gpu;

pub use cache::{CameraCache, CameraKey, HostCameraCache};
pub use camera::{CameraIntrinsics, CameraPose, PinholeCamera, View, ViewSet};
pub use config::{CostFunction, DepthInterpolation, FilteringAxes, MatchingConfig, SweepDirection};
pub use depth_list::{DepthHypothesisSet, DepthRange};
pub use error::{ConfigError, Result, SgmError};
pub use export::{CsvDiagnostics, DiagnosticSink, ExportStage, RecordingSink};
pub use memory::{MemoryUsage, SgmBufferPlan};
pub use retrieve::{DepthSim, DepthSimMap};
pub use sgm::{Sgm, TileStats};
pub use tile::{Roi, Tile, TileParams};
