// cost.rs — Per-cell matching cost between a reference and a target camera.
//
// The cost of (reference pixel p, depth d, target camera) compares a window
// around p in the reference image with the same window carried through the
// plane z = d into the target image. Contract for every implementation:
//
//   - bounded in [0, 255], lower is better
//   - 255 means "not computable" (too few valid samples, flat window)
//   - deterministic for identical inputs
//
// Two weighted-window costs are provided. Each window sample q gets the
// adaptive support weight
//
//     w(q) = exp(-|I_rc(q) - I_rc(p)| / gamma_c  -  |q - p| / gamma_p)
//
// so samples that look like the center, and sit close to it, dominate.
// Samples whose reference pixel or projected target position leaves the
// image are skipped. If fewer than half the window survives, the cost is 255.
//
// All arithmetic is f32 and follows the same sequence as
// `shaders/sgm_volume.wgsl`, so CPU and GPU volumes agree up to float
// rounding in the exp/sqrt implementations.

use crate::cache::HostCamera;
use crate::camera::PlaneSweepProjection;
use crate::config::{CostFunction, MatchingConfig};
use crate::volume::SIM_WORST;

/// Weighted variance below which a window is considered flat.
const MIN_VARIANCE: f32 = 1e-2;
/// Projected points at or below this depth are behind the target camera.
const MIN_PROJECTED_Z: f32 = 1e-6;

/// Reference/target cameras at matching scale plus their plane-sweep
/// projection in the f32 layout shared with the GPU kernel.
pub struct CameraPair<'a> {
    pub rc: &'a HostCamera,
    pub tc: &'a HostCamera,
    rows: [[f32; 4]; 3],
}

impl<'a> CameraPair<'a> {
    pub fn new(rc: &'a HostCamera, tc: &'a HostCamera) -> Self {
        let rows = PlaneSweepProjection::new(&rc.camera, &tc.camera).to_rows_f32();
        CameraPair { rc, tc, rows }
    }

    pub fn projection_rows(&self) -> &[[f32; 4]; 3] {
        &self.rows
    }

    /// Target position of reference pixel (u, v) on the plane z = depth.
    #[inline]
    pub fn project(&self, u: f32, v: f32, depth: f32) -> Option<(f32, f32)> {
        let r = &self.rows;
        let px = depth * (r[0][0] * u + r[0][1] * v + r[0][2]) + r[0][3];
        let py = depth * (r[1][0] * u + r[1][1] * v + r[1][2]) + r[1][3];
        let pz = depth * (r[2][0] * u + r[2][1] * v + r[2][2]) + r[2][3];
        if pz <= MIN_PROJECTED_Z {
            return None;
        }
        Some((px / pz, py / pz))
    }
}

/// A per-cell matching cost policy.
pub trait MatchingCost: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cost of reference pixel (x, y) (matching-scale image coordinates)
    /// against the pair's target camera at `depth`.
    fn cost(&self, pair: &CameraPair<'_>, x: usize, y: usize, depth: f32) -> u32;
}

/// Weighted window statistics accumulated by both built-in costs.
#[derive(Default)]
struct WindowStats {
    count: u32,
    sw: f32,
    sx: f32,
    sy: f32,
    sxx: f32,
    syy: f32,
    sxy: f32,
    sad: f32,
}

#[derive(Debug, Clone, Copy)]
struct WindowParams {
    half_window: i32,
    gamma_c: f32,
    gamma_p: f32,
}

impl WindowParams {
    fn from_config(config: &MatchingConfig) -> Self {
        WindowParams {
            half_window: config.half_window as i32,
            gamma_c: config.gamma_c,
            gamma_p: config.gamma_p,
        }
    }

    fn window_len(&self) -> u32 {
        let side = (2 * self.half_window + 1) as u32;
        side * side
    }

    /// Accumulate window statistics. `None` when the center pixel itself
    /// is outside the reference image.
    fn accumulate(&self, pair: &CameraPair<'_>, x: usize, y: usize, depth: f32) -> Option<WindowStats> {
        let rc = &pair.rc.image;
        let tc = &pair.tc.image;
        if x >= rc.width() || y >= rc.height() {
            return None;
        }
        let center = rc.get(x, y);
        let (w, h) = (rc.width() as i32, rc.height() as i32);
        let mut st = WindowStats::default();

        for dy in -self.half_window..=self.half_window {
            let qy = y as i32 + dy;
            if qy < 0 || qy >= h {
                continue;
            }
            for dx in -self.half_window..=self.half_window {
                let qx = x as i32 + dx;
                if qx < 0 || qx >= w {
                    continue;
                }
                let Some((tx, ty)) = pair.project(qx as f32, qy as f32, depth) else {
                    continue;
                };
                let Some(vt) = tc.sample_bilinear(tx, ty) else {
                    continue;
                };
                let vr = rc.get(qx as usize, qy as usize);
                let dist = ((dx * dx + dy * dy) as f32).sqrt();
                let wgt = (-(vr - center).abs() / self.gamma_c - dist / self.gamma_p).exp();

                st.count += 1;
                st.sw += wgt;
                st.sx += wgt * vr;
                st.sy += wgt * vt;
                st.sxx += wgt * vr * vr;
                st.syy += wgt * vt * vt;
                st.sxy += wgt * vr * vt;
                st.sad += wgt * (vr - vt).abs();
            }
        }
        Some(st)
    }

    fn enough_samples(&self, st: &WindowStats) -> bool {
        st.count * 2 >= self.window_len() && st.sw > 0.0
    }
}

/// Quantize a value in [0, 254] the same way the kernel does.
#[inline]
fn quantize(v: f32) -> u32 {
    ((v + 0.5).floor() as u32).min(SIM_WORST - 1)
}

// ---------------------------------------------------------------------------
// Weighted ZNCC
// ---------------------------------------------------------------------------

/// Adaptive-weight zero-mean normalized cross-correlation.
///
/// cost = round((1 - ncc) * 127): 0 for a perfect match, 254 for an
/// inverted window.
#[derive(Debug, Clone, Copy)]
pub struct WeightedZncc {
    params: WindowParams,
}

impl WeightedZncc {
    pub fn new(half_window: u32, gamma_c: f32, gamma_p: f32) -> Self {
        WeightedZncc { params: WindowParams { half_window: half_window as i32, gamma_c, gamma_p } }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        WeightedZncc { params: WindowParams::from_config(config) }
    }
}

impl MatchingCost for WeightedZncc {
    fn name(&self) -> &'static str {
        "weighted-zncc"
    }

    fn cost(&self, pair: &CameraPair<'_>, x: usize, y: usize, depth: f32) -> u32 {
        let Some(st) = self.params.accumulate(pair, x, y, depth) else {
            return SIM_WORST;
        };
        if !self.params.enough_samples(&st) {
            return SIM_WORST;
        }
        let mx = st.sx / st.sw;
        let my = st.sy / st.sw;
        let vx = st.sxx / st.sw - mx * mx;
        let vy = st.syy / st.sw - my * my;
        if vx < MIN_VARIANCE || vy < MIN_VARIANCE {
            return SIM_WORST;
        }
        let cov = st.sxy / st.sw - mx * my;
        let ncc = (cov / (vx * vy).sqrt()).clamp(-1.0, 1.0);
        quantize((1.0 - ncc) * 127.0)
    }
}

// ---------------------------------------------------------------------------
// Weighted SAD
// ---------------------------------------------------------------------------

/// Adaptive-weight mean absolute intensity difference.
#[derive(Debug, Clone, Copy)]
pub struct WeightedSad {
    params: WindowParams,
}

impl WeightedSad {
    pub fn new(half_window: u32, gamma_c: f32, gamma_p: f32) -> Self {
        WeightedSad { params: WindowParams { half_window: half_window as i32, gamma_c, gamma_p } }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        WeightedSad { params: WindowParams::from_config(config) }
    }
}

impl MatchingCost for WeightedSad {
    fn name(&self) -> &'static str {
        "weighted-sad"
    }

    fn cost(&self, pair: &CameraPair<'_>, x: usize, y: usize, depth: f32) -> u32 {
        let Some(st) = self.params.accumulate(pair, x, y, depth) else {
            return SIM_WORST;
        };
        if !self.params.enough_samples(&st) {
            return SIM_WORST;
        }
        quantize(st.sad / st.sw)
    }
}

/// The cost selected by `config.cost_function`.
pub fn matching_cost_from_config(config: &MatchingConfig) -> Box<dyn MatchingCost> {
    match config.cost_function {
        CostFunction::Zncc => Box::new(WeightedZncc::from_config(config)),
        CostFunction::Sad => Box::new(WeightedSad::from_config(config)),
    }
}
