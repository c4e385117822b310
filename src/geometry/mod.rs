//! Geometry utilities: SE(3) rigid transforms.

pub mod se3;

pub use se3::SE3;
