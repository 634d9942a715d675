// error.rs — Error taxonomy for the matching engines.
//
// Three classes of failure exist and none of them is transient:
//   1. Caller-contract violations (no target cameras, empty depth list,
//      depth ranges that do not fit the hypothesis set, tiles larger than
//      the engine was sized for). Detected before any work is issued.
//   2. Allocation failures at engine construction (GPU out-of-memory).
//   3. Device execution failures while processing a tile.
//
// Nothing here is retried. A failed tile aborts that reference view; what
// happens to the rest of the batch is the caller's decision.

use std::path::PathBuf;

use thiserror::Error;

use crate::gpu::device::GpuError;

/// Errors raised by `Sgm` / `GpuSgm` and the components they drive.
#[derive(Debug, Error)]
pub enum SgmError {
    #[error("{tile}Cannot compute depth/sim map of view id {view_id}: no target camera")]
    NoTargetCameras { view_id: usize, tile: String },

    #[error("{tile}Cannot compute depth/sim map of view id {view_id}: empty depth list")]
    EmptyDepthList { view_id: usize, tile: String },

    #[error("depth list holds {count} hypotheses, engine was sized for at most {max}")]
    TooManyDepths { count: usize, max: usize },

    #[error("{ranges} depth ranges given for {tcams} target cameras")]
    DepthRangeCount { ranges: usize, tcams: usize },

    #[error("depth range [{first}, {first}+{count}) of tc {tc} exceeds the {depths} hypotheses")]
    DepthRangeOutOfBounds {
        tc: usize,
        first: usize,
        count: usize,
        depths: usize,
    },

    #[error(
        "tile region {width}x{height} (matching resolution) exceeds the allocated \
         {max_width}x{max_height}"
    )]
    TileTooLarge {
        width: usize,
        height: usize,
        max_width: usize,
        max_height: usize,
    },

    #[error("unknown camera id {0}")]
    UnknownCamera(usize),

    #[error("image of camera {camera} is {width}x{height}, intrinsics say {expected_width}x{expected_height}")]
    ImageSizeMismatch {
        camera: usize,
        width: usize,
        height: usize,
        expected_width: usize,
        expected_height: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("diagnostic export failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from loading or validating a `MatchingConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

pub type Result<T, E = SgmError> = std::result::Result<T, E>;
