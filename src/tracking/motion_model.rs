//! Constant-velocity motion model between consecutive frames.

use crate::geometry::SE3;

/// Holds the pose delta observed between the last two tracked frames.
///
/// The velocity is `Tcw_current · Twc_last`, so composing it with the last
/// world-to-camera pose predicts the next one.
#[derive(Debug, Default)]
pub struct MotionModel {
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.velocity.is_some()
    }

    pub fn velocity(&self) -> Option<&SE3> {
        self.velocity.as_ref()
    }

    /// Update from the current and previous world-to-camera poses. A missing
    /// previous pose invalidates the model.
    pub fn update(&mut self, current_tcw: &SE3, last_tcw: Option<&SE3>) {
        self.velocity = last_tcw.map(|last| current_tcw * &last.inverse());
    }

    /// Predict the current pose from the previous one.
    pub fn predict(&self, last_tcw: &SE3) -> Option<SE3> {
        self.velocity.as_ref().map(|v| v * last_tcw)
    }

    pub fn clear(&mut self) {
        self.velocity = None;
    }
}
