//! Trait seams for the tracker's external collaborators.
//!
//! Feature extraction, descriptor matching, nonlinear optimization, direct
//! image alignment and two-view reconstruction are heavyweight components
//! with lives of their own; the tracker only depends on these contracts.

use image::GrayImage;
use nalgebra::{Point2, Vector3};

use crate::features::FeatureSet;
use crate::geometry::SE3;
use crate::map::{KeyFrame, Map, MapPointId};
use crate::tracking::frame::Frame;

/// Produces keypoints and descriptors for a grayscale image.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &GrayImage) -> FeatureSet;
}

/// Reference source for projection searches and image alignment.
pub enum AlignTarget<'a> {
    KeyFrame(&'a KeyFrame),
    LastFrame(&'a Frame),
}

/// Associates current-frame keypoints to map points.
///
/// All searches write their associations into `frame.map_points` and return
/// the number of matches made. `radius` is a pixel window scaled internally
/// by the ORB pyramid level of each candidate.
pub trait DescriptorMatcher: Send + Sync {
    /// Project the map points seen by a reference keyframe.
    fn search_by_projection_keyframe(
        &self,
        frame: &mut Frame,
        reference: &KeyFrame,
        map: &Map,
        radius: u32,
        monocular: bool,
    ) -> usize;

    /// Project the map points tracked by the previous frame.
    fn search_by_projection_frame(
        &self,
        frame: &mut Frame,
        last: &Frame,
        map: &Map,
        radius: u32,
        monocular: bool,
    ) -> usize;

    /// Project an explicit candidate set (the local map). Candidates carry
    /// their projection cache from the preceding frustum pass.
    fn search_by_projection_points(
        &self,
        frame: &mut Frame,
        candidates: &[MapPointId],
        map: &Map,
        radius: u32,
    ) -> usize;

    /// Match two initialization frames; `matches[i]` receives the current
    /// keypoint index for reference keypoint `i`, or -1. `prev_matched` is
    /// the running position buffer updated with each successful match.
    fn search_for_initialization(
        &self,
        reference: &Frame,
        current: &Frame,
        prev_matched: &mut [Point2<f32>],
        matches: &mut [i32],
        window: u32,
    ) -> usize;
}

/// Nonlinear refinement of frame poses and the initial map.
pub trait Optimizer: Send + Sync {
    /// Refine `frame.pose` from its map-point associations, flagging
    /// per-keypoint outliers. Returns the inlier count.
    fn pose_optimization(&self, frame: &mut Frame, map: &Map) -> usize;

    /// Full bundle adjustment; used once at monocular initialization.
    fn global_bundle_adjustment(&self, map: &mut Map, iterations: usize);
}

/// Direct-method warm start aligning the current image to a reference.
pub trait ImageAligner: Send + Sync {
    /// Refine `frame.pose` photometrically. `reloc` selects the wider
    /// convergence basin used for relocalization candidates.
    fn compute_pose(&self, frame: &mut Frame, target: AlignTarget<'_>, reloc: bool) -> bool;
}

/// Result of a successful two-view reconstruction.
#[derive(Debug, Clone)]
pub struct TwoViewGeometry {
    /// Pose of the current frame relative to the reference (Tcw with the
    /// reference at identity).
    pub pose: SE3,
    /// Triangulated point per reference keypoint index.
    pub points: Vec<Vector3<f64>>,
    /// Whether the triangulation for each matched pair passed the checks.
    pub triangulated: Vec<bool>,
}

/// Two-view geometric initialization from monocular correspondences.
pub trait MonoInitializer: Send + Sync {
    /// Attempt model selection (homography/fundamental), decomposition and
    /// triangulation. None when no model passes the checks.
    fn initialize(&self, reference: &Frame, current: &Frame, matches: &[i32])
        -> Option<TwoViewGeometry>;
}

/// Visualization thread handle, polled during reset.
pub trait Viewer: Send + Sync {
    fn request_stop(&self);
    fn is_stopped(&self) -> bool;
    fn release(&self);
}

/// System-level notifications emitted by the tracker.
pub trait TrackingEvents: Send + Sync {
    /// Tracking was lost with a map too small to relocalize in; the system
    /// should orchestrate a full reset.
    fn reset_requested(&self) {}
}
