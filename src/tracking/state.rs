//! Tracking state machine states.

/// State of the tracking front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No frame has arrived yet.
    #[default]
    NoImagesYet,
    /// Frames are arriving but no map exists yet.
    NotInitialized,
    /// Tracking normally.
    Ok,
    /// Pose refinement failed; relocalization needed.
    Lost,
}
