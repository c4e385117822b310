//! Tracking thread: estimates the camera pose for every incoming frame and
//! decides when to promote a frame into a keyframe.
//!
//! Per-frame pipeline:
//! - frame construction (feature extraction behind the `FeatureExtractor` seam)
//! - initialization (stereo/RGB-D one-shot or monocular two-view)
//! - coarse pose from the motion model or the reference keyframe,
//!   relocalization after loss
//! - local-map refinement (covisibility neighborhood, projection search)
//! - keyframe decision and handoff to local mapping

pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod local_map;
pub mod motion_model;
pub mod state;
pub mod tracker;
pub mod trajectory;

#[cfg(test)]
pub(crate) mod test_support;

pub use state::TrackingState;
pub use tracker::{Collaborators, TrackingEngine};

use thiserror::Error;

/// Failure modes of one tracking attempt.
///
/// All of these are recoverable: the engine maps them to fallback paths or a
/// `Lost` transition. The only escalation is a full system reset.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("direct image alignment did not converge")]
    ImageAlignFailed,

    #[error("projection search found {found} matches, needed {needed}")]
    InsufficientMatches { found: usize, needed: usize },

    #[error("pose optimization kept {inliers} inliers")]
    PoseOptimizationRejected { inliers: usize },

    #[error("two-view initialization rejected")]
    InitializationRejected,

    #[error("local mapper refused the not-stop signal")]
    BackendBusy,

    #[error("no pose available to track from")]
    TrackLost,
}
