// gpu/mod.rs — wgpu compute backend of the matching engine.
//
// Every kernel here has a CPU reference in the parent crate and is checked
// against it: fusion against similarity.rs, aggregation against
// optimize.rs (bit-exact), extraction against retrieve.rs (bit-exact for
// nearest-depth extraction).
//
//   device   adapter selection, profiles, limits, error scopes
//   buffer   pitched storage buffers and blocking readback
//   camera   device-resident camera images, cached per (camera, scale)
//   kernels  pipelines and dispatch recording
//   sgm      `GpuSgm`, the per-tile engine
//
// GPU tests are `#[ignore]`d and run each case in a child process; see
// `device::tests`.

pub mod buffer;
pub mod camera;
pub mod device;
pub mod kernels;
pub mod sgm;

pub use camera::{DeviceCamera, DeviceCameraCache};
pub use device::{DeviceProfile, GpuDevice, GpuError, WorkgroupSize};
pub use sgm::GpuSgm;
