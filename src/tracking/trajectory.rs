//! Append-only record of per-frame relative poses.
//!
//! Each entry stores the transform from the reference keyframe to the camera
//! (Tcr) rather than an absolute pose, so back-end corrections to keyframe
//! poses automatically propagate when the trajectory is recovered.

use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map};

/// One recorded frame.
#[derive(Debug, Clone)]
pub struct TrajectoryEntry {
    /// Camera pose relative to the reference keyframe (Tcr).
    pub relative_pose: SE3,
    pub reference_kf: KeyFrameId,
    pub timestamp: f64,
    /// Whether tracking was lost at this frame.
    pub lost: bool,
}

/// Append-only per-frame trajectory record.
#[derive(Debug, Default)]
pub struct TrajectoryLog {
    entries: Vec<TrajectoryEntry>,
}

impl TrajectoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, relative_pose: SE3, reference_kf: KeyFrameId, timestamp: f64, lost: bool) {
        self.entries.push(TrajectoryEntry {
            relative_pose,
            reference_kf,
            timestamp,
            lost,
        });
    }

    /// Duplicate the last entry, overriding only the lost flag. Used when a
    /// frame produced no pose.
    pub fn repeat_last(&mut self, lost: bool) {
        if let Some(last) = self.entries.last() {
            let mut entry = last.clone();
            entry.lost = lost;
            self.entries.push(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TrajectoryEntry> {
        self.entries.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrajectoryEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Recover absolute camera poses (Tcw) by composing each relative pose
    /// with the current pose of its reference keyframe.
    ///
    /// Entries whose reference keyframe no longer exists are skipped.
    pub fn absolute_poses(&self, map: &Map) -> Vec<(f64, SE3)> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let kf = map.keyframe(entry.reference_kf)?;
                Some((entry.timestamp, &entry.relative_pose * &kf.pose))
            })
            .collect()
    }
}
