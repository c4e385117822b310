//! Pinhole camera model with radial-tangential distortion.
//!
//! Keypoints are matched in undistorted pixel coordinates; the model keeps
//! both the intrinsic matrix and the distortion coefficients so frames can
//! undistort raw detections and clamp projections to the valid image region.

use nalgebra::Vector3;

/// Pinhole intrinsics plus distortion and stereo baseline.
///
/// `bf` is the stereo baseline times the focal length, in pixel·meters; it is
/// zero for a monocular setup.
#[derive(Debug, Clone, Copy)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub bf: f64,
    pub width: u32,
    pub height: u32,
    /// Undistorted image bounds, computed from the distorted corners.
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        let mut cam = Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            k3: 0.0,
            bf: 0.0,
            width,
            height,
            min_x: 0.0,
            max_x: width as f64,
            min_y: 0.0,
            max_y: height as f64,
        };
        cam.update_bounds();
        cam
    }

    pub fn with_distortion(mut self, k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) -> Self {
        self.k1 = k1;
        self.k2 = k2;
        self.p1 = p1;
        self.p2 = p2;
        self.k3 = k3;
        self.update_bounds();
        self
    }

    pub fn with_baseline(mut self, bf: f64) -> Self {
        self.bf = bf;
        self
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0 || self.k3 != 0.0
    }

    /// Project a camera-frame point to undistorted pixel coordinates.
    /// Returns None for points at or behind the camera plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some((
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Back-project an undistorted pixel at depth `z` into the camera frame.
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// Apply the distortion model to normalized coordinates.
    fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Undistort a raw pixel coordinate by fixed-point inversion of the
    /// distortion model.
    pub fn undistort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }

        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;

        let mut x = xd;
        let mut y = yd;
        for _ in 0..10 {
            let (dx, dy) = self.distort_normalized(x, y);
            x += xd - dx;
            y += yd - dy;
        }

        (self.fx * x + self.cx, self.fy * y + self.cy)
    }

    /// Whether an undistorted pixel lies inside the undistorted image bounds.
    pub fn in_image(&self, u: f64, v: f64) -> bool {
        u >= self.min_x && u < self.max_x && v >= self.min_y && v < self.max_y
    }

    /// Recompute the undistorted bounds from the four image corners.
    fn update_bounds(&mut self) {
        if !self.has_distortion() {
            self.min_x = 0.0;
            self.max_x = self.width as f64;
            self.min_y = 0.0;
            self.max_y = self.height as f64;
            return;
        }

        let w = self.width as f64;
        let h = self.height as f64;
        let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)];
        let undistorted: Vec<(f64, f64)> = corners
            .iter()
            .map(|&(u, v)| self.undistort_point(u, v))
            .collect();

        self.min_x = undistorted[0].0.min(undistorted[2].0);
        self.max_x = undistorted[1].0.max(undistorted[3].0);
        self.min_y = undistorted[0].1.min(undistorted[1].1);
        self.max_y = undistorted[2].1.max(undistorted[3].1);
    }
}
