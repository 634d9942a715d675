// config.rs — Matching configuration, loadable from TOML.
//
// `MatchingConfig` carries every knob the engines read: matching
// resolution (scale, step_xy), buffer depth (max_depths), the aggregation
// switch and its sweep set, the diagnostic toggle, and the parameters of
// the matching cost and the SGM penalties.
//
// FILTERING AXES
// ──────────────
// Aggregation sweeps are directed: +X runs left→right, −X right→left,
// +Y top→bottom, −Y bottom→top. The string form accepted in TOML is a
// sequence of tokens, each either a bare axis letter (both directions) or
// a signed one (single direction):
//
//   "YX"    → +Y −Y +X −X   (classic four-path SGM)
//   "X"     → +X −X
//   "+X"    → +X only
//   "-Y+X"  → −Y +X
//
// NEW RUST CONCEPTS
// ──────────────────
// - `#[serde(default)]` — missing TOML keys fall back to `Default::default()`.
// - `#[serde(try_from = "String", into = "String")]` — (de)serialize a
//   structured type through its textual form, with validation on the way in.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Sweep directions
// ---------------------------------------------------------------------------

/// One directed aggregation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepDirection {
    PosX,
    NegX,
    PosY,
    NegY,
}

impl SweepDirection {
    /// True for sweeps that walk along x (one path per volume row).
    pub fn is_horizontal(self) -> bool {
        matches!(self, SweepDirection::PosX | SweepDirection::NegX)
    }

    /// True when the path walks toward increasing coordinates.
    pub fn is_forward(self) -> bool {
        matches!(self, SweepDirection::PosX | SweepDirection::PosY)
    }

    fn token(self) -> &'static str {
        match self {
            SweepDirection::PosX => "+X",
            SweepDirection::NegX => "-X",
            SweepDirection::PosY => "+Y",
            SweepDirection::NegY => "-Y",
        }
    }
}

impl fmt::Display for SweepDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Ordered set of directed sweeps used by the aggregator.
///
/// The aggregated result is a sum over sweeps, so order only affects the
/// sequence in which work is issued, never the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilteringAxes(Vec<SweepDirection>);

impl FilteringAxes {
    /// Build from an explicit sweep list. Rejects duplicates.
    pub fn new(sweeps: Vec<SweepDirection>) -> Result<Self, ConfigError> {
        for (i, s) in sweeps.iter().enumerate() {
            if sweeps[..i].contains(s) {
                return Err(ConfigError::Invalid(format!(
                    "filtering axes: sweep {s} listed twice"
                )));
            }
        }
        Ok(FilteringAxes(sweeps))
    }

    pub fn sweeps(&self) -> &[SweepDirection] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for FilteringAxes {
    fn default() -> Self {
        FilteringAxes(vec![
            SweepDirection::PosY,
            SweepDirection::NegY,
            SweepDirection::PosX,
            SweepDirection::NegX,
        ])
    }
}

impl FromStr for FilteringAxes {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut sweeps = Vec::new();
        let mut sign: Option<char> = None;
        for c in s.chars().filter(|c| !c.is_whitespace()) {
            match c {
                '+' | '-' if sign.is_none() => sign = Some(c),
                'X' | 'x' | 'Y' | 'y' => {
                    let horizontal = c.eq_ignore_ascii_case(&'x');
                    let (fwd, bwd) = if horizontal {
                        (SweepDirection::PosX, SweepDirection::NegX)
                    } else {
                        (SweepDirection::PosY, SweepDirection::NegY)
                    };
                    match sign.take() {
                        Some('+') => sweeps.push(fwd),
                        Some(_) => sweeps.push(bwd),
                        None => {
                            sweeps.push(fwd);
                            sweeps.push(bwd);
                        }
                    }
                }
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "filtering axes: unexpected character '{c}' in \"{s}\""
                    )))
                }
            }
        }
        if sign.is_some() {
            return Err(ConfigError::Invalid(format!(
                "filtering axes: dangling sign in \"{s}\""
            )));
        }
        FilteringAxes::new(sweeps)
    }
}

impl TryFrom<String> for FilteringAxes {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FilteringAxes> for String {
    fn from(axes: FilteringAxes) -> Self {
        axes.to_string()
    }
}

impl fmt::Display for FilteringAxes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.0 {
            write!(f, "{s}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Built-in per-cell matching cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostFunction {
    /// Weighted zero-mean normalized cross-correlation.
    #[default]
    Zncc,
    /// Weighted sum of absolute differences.
    Sad,
}

/// How the extractor turns the winning hypothesis into a depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthInterpolation {
    /// Report the winning hypothesis value itself.
    #[default]
    Nearest,
    /// Refine with a parabola through the neighboring costs.
    Parabolic,
}

/// Largest accepted SGM penalty. A path cost stays below 255 + P2, and up
/// to four sweeps are summed in u32.
pub const MAX_PENALTY: u32 = 1 << 20;

/// SGM discontinuity penalties, in cost units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgmPenalties {
    /// Penalty for a ±1 hypothesis step between neighbors.
    pub p1: u32,
    /// Penalty for any larger jump.
    pub p2: u32,
}

impl SgmPenalties {
    /// Both penalties capped at `MAX_PENALTY`.
    pub fn clamped(self) -> Self {
        SgmPenalties { p1: self.p1.min(MAX_PENALTY), p2: self.p2.min(MAX_PENALTY) }
    }
}

// ---------------------------------------------------------------------------
// MatchingConfig
// ---------------------------------------------------------------------------

/// Full configuration of one matching engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Downscale factor of the images used for matching.
    pub scale: u32,
    /// Pixel stride within the scaled image.
    pub step_xy: u32,
    /// Hard cap on the number of depth hypotheses per tile.
    pub max_depths: usize,
    /// Run SGM aggregation on the fused volume.
    pub do_optimize_volume: bool,
    /// Directed sweeps used by the aggregator.
    pub filtering_axes: FilteringAxes,
    /// Emit diagnostic snapshots of the volumes and the output map.
    pub export_intermediate_results: bool,
    /// Half size of the matching window.
    pub half_window: u32,
    /// Intensity falloff of the window weights.
    pub gamma_c: f32,
    /// Spatial falloff of the window weights.
    pub gamma_p: f32,
    pub cost_function: CostFunction,
    pub p1: u32,
    pub p2: u32,
    pub depth_interpolation: DepthInterpolation,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            scale: 2,
            step_xy: 2,
            max_depths: 1500,
            do_optimize_volume: true,
            filtering_axes: FilteringAxes::default(),
            export_intermediate_results: false,
            half_window: 4,
            gamma_c: 5.5,
            gamma_p: 8.0,
            cost_function: CostFunction::Zncc,
            p1: 10,
            p2: 100,
            depth_interpolation: DepthInterpolation::Nearest,
        }
    }
}

impl MatchingConfig {
    /// Full-resolution pixels per volume cell along x and y.
    pub fn downscale(&self) -> u32 {
        self.scale * self.step_xy
    }

    pub fn penalties(&self) -> SgmPenalties {
        SgmPenalties { p1: self.p1, p2: self.p2 }.clamped()
    }

    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Invalid(msg));
        if self.scale < 1 {
            return fail(format!("scale must be >= 1, got {}", self.scale));
        }
        if self.step_xy < 1 {
            return fail(format!("step_xy must be >= 1, got {}", self.step_xy));
        }
        if self.max_depths == 0 {
            return fail("max_depths must be > 0".to_string());
        }
        if self.half_window > 15 {
            return fail(format!("half_window must be <= 15, got {}", self.half_window));
        }
        let positive = |g: f32| g.is_finite() && g > 0.0;
        if !positive(self.gamma_c) || !positive(self.gamma_p) {
            return fail(format!(
                "gamma_c and gamma_p must be positive, got {} and {}",
                self.gamma_c, self.gamma_p
            ));
        }
        if self.p1 > self.p2 {
            return fail(format!("p1 ({}) must not exceed p2 ({})", self.p1, self.p2));
        }
        if self.p2 > MAX_PENALTY {
            return fail(format!("p2 must be <= {MAX_PENALTY}, got {}", self.p2));
        }
        if self.do_optimize_volume && self.filtering_axes.is_empty() {
            return fail("volume optimization enabled with no filtering axes".to_string());
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: MatchingConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }
}
