//! SE(3) rigid-body transform backed by a unit quaternion and a translation.
//!
//! Poses in this crate follow the world-to-camera convention (Tcw): applying
//! the transform to a world point yields camera coordinates. The inverse
//! (Twc) maps camera points back to the world.

use std::ops::Mul;

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// A rigid-body transform in SE(3).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix and a translation vector.
    pub fn from_parts(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_matrix(&rotation),
            translation,
        }
    }

    /// Inverse transform: if `self` maps a→b, the result maps b→a.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Composition `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Rotation as a 3×3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Camera center in world coordinates for a world-to-camera pose,
    /// i.e. the translation component of the inverse.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// True when both components match `other` within `eps`.
    pub fn is_close(&self, other: &SE3, eps: f64) -> bool {
        let dt = (self.translation - other.translation).norm();
        let dr = self.rotation.angle_to(&other.rotation);
        dt <= eps && dr <= eps
    }

    /// Rescale the translation component, leaving rotation untouched.
    pub fn scaled_translation(&self, factor: f64) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation * factor,
        }
    }
}

impl Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        self.compose(rhs)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn rot_z(angle: f64) -> UnitQuaternion<f64> {
        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle)
    }

    #[test]
    fn test_identity_roundtrip() {
        let p = Vector3::new(1.0, -2.0, 3.0);
        assert_eq!(SE3::identity().transform_point(&p), p);
    }

    #[test]
    fn test_inverse() {
        let t = SE3 {
            rotation: rot_z(FRAC_PI_2),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };
        let p = Vector3::new(0.5, -0.25, 2.0);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert!((back - p).norm() < 1e-12);
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let a = SE3 {
            rotation: rot_z(0.3),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let b = SE3 {
            rotation: rot_z(-0.7),
            translation: Vector3::new(0.0, 2.0, -1.0),
        };
        let p = Vector3::new(3.0, 1.0, 4.0);
        let composed = (&a * &b).transform_point(&p);
        let sequential = a.transform_point(&b.transform_point(&p));
        assert!((composed - sequential).norm() < 1e-12);
    }

    #[test]
    fn test_camera_center() {
        // A camera at (0, 0, -5) looking down +Z has Tcw translation (0,0,5).
        let tcw = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, 5.0),
        };
        assert!((tcw.camera_center() - Vector3::new(0.0, 0.0, -5.0)).norm() < 1e-12);
    }

    #[test]
    fn test_velocity_roundtrip() {
        // velocity = Tcw_cur * Twc_last must reproduce Tcw_cur from Tcw_last.
        let last = SE3 {
            rotation: rot_z(0.1),
            translation: Vector3::new(0.2, 0.0, 1.0),
        };
        let cur = SE3 {
            rotation: rot_z(0.15),
            translation: Vector3::new(0.25, -0.05, 1.1),
        };
        let velocity = &cur * &last.inverse();
        assert!((&velocity * &last).is_close(&cur, 1e-12));
    }
}
