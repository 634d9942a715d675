// camera.rs -- Pinhole cameras, plane-sweep projection and the view set.
//
// Handles:
// - Pixel <-> normalized (bearing) coordinate conversion
// - Intrinsics at a reduced matching scale
// - World->camera poses and the reference->target homography family used
//   by the plane sweep
// - `ViewSet`: the camera/view metadata accessor the engines consume
//
// PLANE-SWEEP PROJECTION
// ----------------------
// Depth hypotheses are fronto-parallel planes z = d in the reference
// camera frame. A reference pixel (u, v) at depth d back-projects to
// X_rc = d * K_rc^-1 [u v 1]^T. Moving to the target frame and projecting:
//
//     p = K_tc (R_rel X_rc + t_rel) = d * (K_tc R_rel K_rc^-1) [u v 1]^T + K_tc t_rel
//                                   = d * M [u v 1]^T + b
//
// so one 3x3 matrix and one vector per (rc, tc, scale) triple cover every
// pixel and every depth. The GPU kernel receives exactly these numbers.

use nalgebra::{Matrix3, Vector3};

use crate::error::SgmError;
use crate::image::Image;

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIntrinsics {
    /// Focal length in pixels (x-axis).
    pub fx: f64,
    /// Focal length in pixels (y-axis).
    pub fy: f64,
    /// Principal point x (pixels).
    pub cx: f64,
    /// Principal point y (pixels).
    pub cy: f64,
    /// Image resolution [width, height].
    pub resolution: [usize; 2],
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: usize, height: usize) -> Self {
        CameraIntrinsics { fx, fy, cx, cy, resolution: [width, height] }
    }

    /// Convert pixel coordinates (u, v) to normalized coordinates (K^-1 [u v 1]).
    pub fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        ((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    /// Convert normalized coordinates back to pixel coordinates.
    pub fn denormalize(&self, x_n: f64, y_n: f64) -> (f64, f64) {
        (x_n * self.fx + self.cx, y_n * self.fy + self.cy)
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Closed-form K^-1 (no general inversion needed for a pinhole K).
    pub fn k_inverse(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx, 0.0, -self.cx / self.fx,
            0.0, 1.0 / self.fy, -self.cy / self.fy,
            0.0, 0.0, 1.0,
        )
    }

    /// Intrinsics of the image box-downscaled by `scale`.
    ///
    /// Pixel centers sit at integer coordinates. Scaled pixel j averages
    /// full-res pixels j*s .. j*s+s-1, whose mean center is j*s + (s-1)/2.
    /// Hence c' = (c - (s-1)/2) / s and f' = f / s.
    pub fn scaled(&self, scale: u32) -> Self {
        let s = scale.max(1) as f64;
        let shift = (s - 1.0) / 2.0;
        CameraIntrinsics {
            fx: self.fx / s,
            fy: self.fy / s,
            cx: (self.cx - shift) / s,
            cy: (self.cy - shift) / s,
            resolution: [
                self.resolution[0] / scale.max(1) as usize,
                self.resolution[1] / scale.max(1) as usize,
            ],
        }
    }
}

/// World->camera rigid transform: X_cam = R X_world + t.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl CameraPose {
    pub fn identity() -> Self {
        CameraPose { rotation: Matrix3::identity(), translation: Vector3::zeros() }
    }

    /// Pose from an orientation and the camera center in world coordinates.
    pub fn from_center(rotation: Matrix3<f64>, center: Vector3<f64>) -> Self {
        let translation = -(rotation * center);
        CameraPose { rotation, translation }
    }

    /// Camera center in world coordinates: C = -R^T t.
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.transpose() * self.translation)
    }

    pub fn transform(&self, world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * world + self.translation
    }
}

/// Intrinsics + pose.
#[derive(Debug, Clone, PartialEq)]
pub struct PinholeCamera {
    pub intrinsics: CameraIntrinsics,
    pub pose: CameraPose,
}

impl PinholeCamera {
    pub fn new(intrinsics: CameraIntrinsics, pose: CameraPose) -> Self {
        PinholeCamera { intrinsics, pose }
    }

    /// Same camera at matching scale `scale`.
    pub fn scaled(&self, scale: u32) -> Self {
        PinholeCamera { intrinsics: self.intrinsics.scaled(scale), pose: self.pose.clone() }
    }

    /// Project a world point. `None` behind the camera.
    pub fn project(&self, world: &Vector3<f64>) -> Option<(f64, f64)> {
        let p = self.pose.transform(world);
        if p.z <= 0.0 {
            return None;
        }
        Some(self.intrinsics.denormalize(p.x / p.z, p.y / p.z))
    }

    /// Back-project pixel (u, v) onto the plane z = depth (camera frame),
    /// returned in world coordinates.
    pub fn back_project(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        let (xn, yn) = self.intrinsics.normalize(u, v);
        let cam = Vector3::new(xn * depth, yn * depth, depth);
        self.pose.rotation.transpose() * (cam - self.pose.translation)
    }
}

// ---------------------------------------------------------------------------
// Plane-sweep projection
// ---------------------------------------------------------------------------

/// Maps (reference pixel, depth) to a target pixel for one camera pair.
///
/// Both cameras must already be at the same matching scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneSweepProjection {
    /// K_tc R_rel K_rc^-1
    pub m: Matrix3<f64>,
    /// K_tc t_rel
    pub b: Vector3<f64>,
}

impl PlaneSweepProjection {
    pub fn new(rc: &PinholeCamera, tc: &PinholeCamera) -> Self {
        let r_rel = tc.pose.rotation * rc.pose.rotation.transpose();
        let t_rel = tc.pose.translation - r_rel * rc.pose.translation;
        let k_tc = tc.intrinsics.k_matrix();
        PlaneSweepProjection {
            m: k_tc * r_rel * rc.intrinsics.k_inverse(),
            b: k_tc * t_rel,
        }
    }

    /// Target pixel seen by reference pixel (u, v) on the plane z = depth.
    /// `None` if the point lies behind the target camera.
    #[inline]
    pub fn project(&self, u: f64, v: f64, depth: f64) -> Option<(f64, f64)> {
        let p = self.m * Vector3::new(u, v, 1.0) * depth + self.b;
        if p.z <= 1e-9 {
            return None;
        }
        Some((p.x / p.z, p.y / p.z))
    }

    /// Row-major rows of [M | b] as f32, the layout the GPU kernel reads.
    pub fn to_rows_f32(&self) -> [[f32; 4]; 3] {
        let mut rows = [[0.0f32; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for c in 0..3 {
                row[c] = self.m[(r, c)] as f32;
            }
            row[3] = self.b[r] as f32;
        }
        rows
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// A calibrated image: the unit the engines reference by camera id.
#[derive(Debug, Clone)]
pub struct View {
    /// Identifier of the view in the surrounding reconstruction, used in
    /// logs and diagnostic file names.
    pub view_id: usize,
    pub camera: PinholeCamera,
    pub image: Image<u8>,
}

/// Camera/view metadata accessor: camera id -> view.
///
/// Camera ids are dense indices in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ViewSet {
    views: Vec<View>,
}

impl ViewSet {
    pub fn new() -> Self {
        ViewSet { views: Vec::new() }
    }

    /// Add a view and return its camera id.
    pub fn push(&mut self, view: View) -> Result<usize, SgmError> {
        let [w, h] = view.camera.intrinsics.resolution;
        if view.image.width() != w || view.image.height() != h {
            return Err(SgmError::ImageSizeMismatch {
                camera: self.views.len(),
                width: view.image.width(),
                height: view.image.height(),
                expected_width: w,
                expected_height: h,
            });
        }
        self.views.push(view);
        Ok(self.views.len() - 1)
    }

    pub fn get(&self, camera: usize) -> Result<&View, SgmError> {
        self.views.get(camera).ok_or(SgmError::UnknownCamera(camera))
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.views.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(100.0, 100.0, 31.5, 31.5, 64, 64)
    }

    #[test]
    fn test_normalize_denormalize() {
        let cam = CameraIntrinsics::new(458.654, 457.296, 367.215, 248.375, 752, 480);
        let (xn, yn) = cam.normalize(367.215, 248.375);
        assert!(xn.abs() < 1e-10, "principal point should normalize to (0, 0)");
        assert!(yn.abs() < 1e-10);

        let (u, v) = cam.denormalize(0.1, -0.2);
        let (xn, yn) = cam.normalize(u, v);
        assert!((xn - 0.1).abs() < 1e-10);
        assert!((yn + 0.2).abs() < 1e-10);
    }

    #[test]
    fn test_k_inverse() {
        let k = intrinsics();
        let prod = k.k_matrix() * k.k_inverse();
        assert!((prod - Matrix3::identity()).norm() < 1e-12);
    }

    #[test]
    fn test_scaled_pixel_centers() {
        // Full-res coordinate 0.5 is the center of the first 2×2 block.
        let k = intrinsics();
        let k2 = k.scaled(2);
        assert_eq!(k2.resolution, [32, 32]);
        assert!((k2.fx - 50.0).abs() < 1e-12);
        // A ray through full-res (0.5, 0.5) must hit scaled (0, 0).
        let (xn, yn) = k.normalize(0.5, 0.5);
        let (u, v) = k2.denormalize(xn, yn);
        assert!(u.abs() < 1e-12 && v.abs() < 1e-12, "got ({u}, {v})");
    }

    #[test]
    fn test_pose_center_roundtrip() {
        let r = nalgebra::Rotation3::from_euler_angles(0.1, -0.2, 0.3).into_inner();
        let c = Vector3::new(1.0, 2.0, -3.0);
        let pose = CameraPose::from_center(r, c);
        assert!((pose.center() - c).norm() < 1e-12);
        assert!(pose.transform(&c).norm() < 1e-12);
    }

    #[test]
    fn test_plane_sweep_matches_explicit_projection() {
        let rc = PinholeCamera::new(intrinsics(), CameraPose::identity());
        let r = nalgebra::Rotation3::from_euler_angles(0.02, 0.05, -0.01).into_inner();
        let tc = PinholeCamera::new(
            intrinsics(),
            CameraPose::from_center(r, Vector3::new(0.4, -0.1, 0.05)),
        );
        let proj = PlaneSweepProjection::new(&rc, &tc);

        for &(u, v, d) in &[(10.0, 20.0, 4.0), (50.5, 3.25, 7.5), (31.5, 31.5, 2.0)] {
            let world = rc.back_project(u, v, d);
            let expected = tc.project(&world).unwrap();
            let got = proj.project(u, v, d).unwrap();
            assert!((got.0 - expected.0).abs() < 1e-9, "{got:?} vs {expected:?}");
            assert!((got.1 - expected.1).abs() < 1e-9, "{got:?} vs {expected:?}");
        }
    }

    #[test]
    fn test_plane_sweep_behind_camera() {
        let rc = PinholeCamera::new(intrinsics(), CameraPose::identity());
        // Target looks the other way: rotation of 180° about y.
        let r = nalgebra::Rotation3::from_euler_angles(0.0, std::f64::consts::PI, 0.0).into_inner();
        let tc = PinholeCamera::new(intrinsics(), CameraPose::from_center(r, Vector3::zeros()));
        let proj = PlaneSweepProjection::new(&rc, &tc);
        assert!(proj.project(31.5, 31.5, 5.0).is_none());
    }

    #[test]
    fn test_view_set_rejects_size_mismatch() {
        let mut views = ViewSet::new();
        let cam = PinholeCamera::new(intrinsics(), CameraPose::identity());
        let err = views
            .push(View { view_id: 7, camera: cam.clone(), image: Image::new(10, 10) })
            .unwrap_err();
        assert!(matches!(err, SgmError::ImageSizeMismatch { .. }));

        let id = views.push(View { view_id: 7, camera: cam, image: Image::new(64, 64) }).unwrap();
        assert_eq!(id, 0);
        assert_eq!(views.get(0).unwrap().view_id, 7);
        assert!(matches!(views.get(1), Err(SgmError::UnknownCamera(1))));
    }
}
