//! Feature primitives shared by frames, keyframes and the matcher seam.

use nalgebra::Point2;

/// A 256-bit ORB descriptor row.
pub type Descriptor = [u8; 32];

/// A detected keypoint with its pyramid level and orientation.
#[derive(Debug, Clone, Copy)]
pub struct KeyPoint {
    /// Pixel position.
    pub pt: Point2<f32>,
    /// Pyramid level the point was detected at.
    pub octave: i32,
    /// Orientation in degrees, or -1 when not computed.
    pub angle: f32,
    /// Detector response.
    pub response: f32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32, octave: i32) -> Self {
        Self {
            pt: Point2::new(x, y),
            octave,
            angle: -1.0,
            response: 0.0,
        }
    }
}

/// Keypoints plus their descriptors, as produced by a feature extractor.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}
