// synthetic.rs — Deterministic multi-view scenes with known depth.
//
// A reference camera sits at the world origin looking down +Z. Target
// cameras share its intrinsics and orientation and are translated in the
// XY plane. The scene is a textured background plane at `depth`, with an
// optional rectangular foreground plate (given in reference pixels) at a
// nearer depth. Images are rendered by ray casting, so parallax and
// occlusion are exact and the reference ground truth is known per pixel.
//
// The texture is value noise on a world-space lattice: a hashed gray level
// per lattice node, smoothly interpolated. It is fixed by the seed, so
// every test and bench sees the same images.

use nalgebra::{Matrix3, Vector3};

use crate::camera::{CameraIntrinsics, CameraPose, PinholeCamera, View, ViewSet};
use crate::depth_list::DepthHypothesisSet;
use crate::error::Result;
use crate::image::Image;
use crate::tile::Roi;

/// Foreground plate: reference-pixel rectangle at a nearer depth.
#[derive(Debug, Clone, Copy)]
pub struct Foreground {
    pub roi: Roi,
    pub depth: f64,
}

/// A rendered scene.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub views: ViewSet,
    /// Camera id of the reference view.
    pub rc: usize,
    /// Camera ids of the target views, in builder order.
    pub tcs: Vec<usize>,
    /// Per-pixel depth seen by the reference camera.
    pub ground_truth: Image<f32>,
    pub focal: f64,
    /// Largest |baseline| among the target cameras.
    pub max_baseline: f64,
}

impl SyntheticScene {
    /// Hypotheses whose disparity for the widest baseline is uniform over
    /// [disp_min, disp_max], every target covering the full list.
    pub fn hypotheses(&self, disp_min: f64, disp_max: f64, count: usize) -> DepthHypothesisSet {
        let depths = depths_for_disparities(self.focal, self.max_baseline, disp_min, disp_max, count);
        DepthHypothesisSet::full_coverage(depths, self.tcs.len())
    }
}

/// `count` depths, ascending, whose disparities `f·B/z` step uniformly
/// from `disp_max` down to `disp_min`.
pub fn depths_for_disparities(focal: f64, baseline: f64, disp_min: f64, disp_max: f64, count: usize) -> Vec<f32> {
    if count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![(focal * baseline / disp_max) as f32];
    }
    let step = (disp_max - disp_min) / (count - 1) as f64;
    (0..count)
        .map(|i| (focal * baseline / (disp_max - step * i as f64)) as f32)
        .collect()
}

/// Builder for `SyntheticScene`.
#[derive(Debug, Clone)]
pub struct SceneBuilder {
    width: usize,
    height: usize,
    focal: f64,
    depth: f64,
    baselines: Vec<(f64, f64)>,
    foreground: Option<Foreground>,
    texture_spacing: f64,
    seed: u32,
    view_id_base: usize,
}

impl SceneBuilder {
    /// `width × height` views, focal 100 px, background at depth 5 and a
    /// single target camera 0.5 to the right (disparity 10 px).
    pub fn new(width: usize, height: usize) -> Self {
        SceneBuilder {
            width,
            height,
            focal: 100.0,
            depth: 5.0,
            baselines: vec![(0.5, 0.0)],
            foreground: None,
            texture_spacing: 0.08,
            seed: 1,
            view_id_base: 0,
        }
    }

    pub fn focal(mut self, focal: f64) -> Self {
        self.focal = focal;
        self
    }

    pub fn depth(mut self, depth: f64) -> Self {
        self.depth = depth;
        self
    }

    /// Target camera centers (x, y), one target per entry.
    pub fn baselines(mut self, baselines: Vec<(f64, f64)>) -> Self {
        self.baselines = baselines;
        self
    }

    pub fn foreground(mut self, roi: Roi, depth: f64) -> Self {
        self.foreground = Some(Foreground { roi, depth });
        self
    }

    /// Lattice spacing of the texture, world units.
    pub fn texture_spacing(mut self, spacing: f64) -> Self {
        self.texture_spacing = spacing;
        self
    }

    pub fn seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// View id of the reference view; targets follow consecutively.
    pub fn view_id_base(mut self, base: usize) -> Self {
        self.view_id_base = base;
        self
    }

    fn intrinsics(&self) -> CameraIntrinsics {
        CameraIntrinsics::new(
            self.focal,
            self.focal,
            (self.width as f64 - 1.0) / 2.0,
            (self.height as f64 - 1.0) / 2.0,
            self.width,
            self.height,
        )
    }

    /// Hit point (world x, y) and depth of the ray through pixel (u, v).
    fn cast(&self, camera: &PinholeCamera, u: f64, v: f64) -> (f64, f64, f64) {
        let center = camera.pose.center();
        let (xn, yn) = camera.intrinsics.normalize(u, v);
        let at = |z: f64| (center.x + xn * z, center.y + yn * z);

        if let Some(fg) = self.foreground {
            let (x, y) = at(fg.depth);
            // Plate extent in world units at its depth, from reference pixels.
            let k = self.intrinsics();
            let (x0, y0) = k.normalize(fg.roi.x.begin as f64 - 0.5, fg.roi.y.begin as f64 - 0.5);
            let (x1, y1) = k.normalize(fg.roi.x.end as f64 - 0.5, fg.roi.y.end as f64 - 0.5);
            let inside = x >= x0 * fg.depth && x < x1 * fg.depth && y >= y0 * fg.depth && y < y1 * fg.depth;
            if inside {
                return (x, y, fg.depth);
            }
        }
        let (x, y) = at(self.depth);
        (x, y, self.depth)
    }

    fn lattice(&self, i: i64, j: i64) -> f64 {
        let mut h = (i as u32).wrapping_mul(0x9E37_79B1)
            ^ (j as u32).wrapping_mul(0x85EB_CA77)
            ^ self.seed.wrapping_mul(0xC2B2_AE3D);
        h ^= h >> 15;
        h = h.wrapping_mul(0x2C1B_3C6D);
        h ^= h >> 12;
        h = h.wrapping_mul(0x297A_2D39);
        h ^= h >> 15;
        (h & 0xff) as f64
    }

    fn texture(&self, x: f64, y: f64) -> f64 {
        let gx = x / self.texture_spacing;
        let gy = y / self.texture_spacing;
        let (i, j) = (gx.floor(), gy.floor());
        let smooth = |t: f64| t * t * (3.0 - 2.0 * t);
        let (tx, ty) = (smooth(gx - i), smooth(gy - j));
        let (i, j) = (i as i64, j as i64);
        let top = self.lattice(i, j) * (1.0 - tx) + self.lattice(i + 1, j) * tx;
        let bottom = self.lattice(i, j + 1) * (1.0 - tx) + self.lattice(i + 1, j + 1) * tx;
        top * (1.0 - ty) + bottom * ty
    }

    fn render(&self, camera: &PinholeCamera) -> Image<u8> {
        Image::from_fn(self.width, self.height, |u, v| {
            let (x, y, _) = self.cast(camera, u as f64, v as f64);
            self.texture(x, y).round().clamp(0.0, 255.0) as u8
        })
    }

    pub fn build(&self) -> Result<SyntheticScene> {
        let k = self.intrinsics();
        let rc_cam = PinholeCamera::new(k.clone(), CameraPose::identity());
        let mut views = ViewSet::new();

        let rc = views.push(View {
            view_id: self.view_id_base,
            camera: rc_cam.clone(),
            image: self.render(&rc_cam),
        })?;
        let mut tcs = Vec::with_capacity(self.baselines.len());
        for (i, &(bx, by)) in self.baselines.iter().enumerate() {
            let cam = PinholeCamera::new(
                k.clone(),
                CameraPose::from_center(Matrix3::identity(), Vector3::new(bx, by, 0.0)),
            );
            let image = self.render(&cam);
            tcs.push(views.push(View { view_id: self.view_id_base + 1 + i, camera: cam, image })?);
        }

        let ground_truth = Image::from_fn(self.width, self.height, |u, v| {
            self.cast(&rc_cam, u as f64, v as f64).2 as f32
        });
        let max_baseline = self.baselines.iter().map(|(x, y)| x.hypot(*y)).fold(0.0, f64::max);

        Ok(SyntheticScene { views, rc, tcs, ground_truth, focal: self.focal, max_baseline })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depths_for_disparities() {
        let d = depths_for_disparities(100.0, 0.5, 5.0, 20.0, 4);
        assert_eq!(d.len(), 4);
        // disparities 20, 15, 10, 5
        assert!((d[0] - 2.5).abs() < 1e-6);
        assert!((d[2] - 5.0).abs() < 1e-6);
        assert!((d[3] - 10.0).abs() < 1e-6);
        assert!(d.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_target_sees_shifted_texture() {
        // Background at depth 5, baseline 0.5, f 100 → 10 px disparity.
        let scene = SceneBuilder::new(64, 32).build().unwrap();
        let rc = &scene.views.get(scene.rc).unwrap().image;
        let tc = &scene.views.get(scene.tcs[0]).unwrap().image;
        for y in 4..28 {
            for x in 20..60 {
                let diff = (tc.get(x - 10, y) as i32 - rc.get(x, y) as i32).abs();
                assert!(diff <= 1, "at ({x},{y}): diff {diff}");
            }
        }
    }

    #[test]
    fn test_foreground_ground_truth() {
        let fg = Roi::new(10, 20, 5, 15);
        let scene = SceneBuilder::new(32, 24).foreground(fg, 2.5).build().unwrap();
        assert_eq!(scene.ground_truth.get(12, 8), 2.5);
        assert_eq!(scene.ground_truth.get(9, 8), 5.0);
        assert_eq!(scene.ground_truth.get(19, 14), 2.5);
        assert_eq!(scene.ground_truth.get(20, 14), 5.0);
    }

    #[test]
    fn test_texture_is_deterministic_and_varied() {
        let a = SceneBuilder::new(32, 32).build().unwrap();
        let b = SceneBuilder::new(32, 32).build().unwrap();
        let ia = &a.views.get(0).unwrap().image;
        let ib = &b.views.get(0).unwrap().image;
        assert_eq!(ia.as_slice(), ib.as_slice());
        let min = ia.as_slice().iter().min().unwrap();
        let max = ia.as_slice().iter().max().unwrap();
        assert!(max - min > 100);
    }
}
