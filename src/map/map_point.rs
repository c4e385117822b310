//! MapPoint - a 3D landmark observed by keyframes.
//!
//! Besides the persistent observation graph, each point carries transient
//! per-frame tracking fields (projection cache, visibility counters) that the
//! tracker rewrites every tick, and a `replaced_by` forwarder written by the
//! mapping back-end when duplicate points are fused.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::features::Descriptor;

use super::types::{FrameId, KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more keyframes.
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world coordinates.
    pub position: Vector3<f64>,

    /// Representative ORB descriptor, copied from the creating observation.
    pub descriptor: Descriptor,

    /// Observing keyframes, mapped to the keypoint index in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance bounds derived from the ORB pyramid.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Frames in which the point fell inside the frustum.
    pub visible: u32,

    /// Frames in which the point was actually matched.
    pub found: u32,

    /// Keyframe that created this point, if any.
    pub first_kf: Option<KeyFrameId>,

    /// Forwarder set by the back-end when this point was fused into another.
    /// Written once, never cleared; readers walk at most one hop.
    pub replaced_by: Option<MapPointId>,

    /// Tombstone set by the back-end; bad points are swept lazily.
    pub is_bad: bool,

    // Transient per-frame tracking state, owned by the tracker.
    pub last_frame_seen: Option<FrameId>,
    pub track_reference_for_frame: Option<FrameId>,
    pub track_in_view: bool,
    pub track_proj_x: f64,
    pub track_proj_y: f64,
    pub track_view_cos: f64,
    pub track_scale_level: i32,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf: Option<KeyFrameId>,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible: 0,
            found: 0,
            first_kf,
            replaced_by: None,
            is_bad: false,
            last_frame_seen: None,
            track_reference_for_frame: None,
            track_in_view: false,
            track_proj_x: 0.0,
            track_proj_y: 0.0,
            track_view_cos: 0.0,
            track_scale_level: 0,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, keypoint_idx: usize) {
        self.observations.insert(kf_id, keypoint_idx);
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn increase_visible(&mut self) {
        self.visible += 1;
    }

    pub fn increase_found(&mut self) {
        self.found += 1;
    }

    /// found/visible ratio; 1.0 for points never tested for visibility.
    pub fn found_ratio(&self) -> f64 {
        if self.visible == 0 {
            1.0
        } else {
            self.found as f64 / self.visible as f64
        }
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Recompute the mean viewing direction and the distance bounds from the
    /// observing keyframe centers.
    ///
    /// The bounds stretch the closest/farthest observation by the pyramid
    /// scale range so frustum tests accept the point wherever its descriptor
    /// scale would still match.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = &'a Vector3<f64>>,
        scale_factor: f64,
        n_levels: u32,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut min_dist = f64::INFINITY;
        let mut max_dist = 0.0f64;

        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                min_dist = min_dist.min(dist);
                max_dist = max_dist.max(dist);
            }
        }

        let norm = normal_sum.norm();
        if norm > 1e-10 {
            self.normal = normal_sum / norm;
        }
        if max_dist > 0.0 {
            let scale_range = scale_factor.powi(n_levels as i32 - 1);
            self.min_distance = min_dist / scale_range;
            self.max_distance = max_dist * scale_range;
        }
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Predict the pyramid level a point at `distance` would be detected at.
    pub fn predict_scale(&self, distance: f64, scale_factor: f64, n_levels: u32) -> i32 {
        if distance <= 0.0 || self.max_distance <= 0.0 {
            return 0;
        }
        let ratio = self.max_distance / distance;
        let level = (ratio.ln() / scale_factor.ln()).ceil() as i32;
        level.clamp(0, n_levels as i32 - 1)
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible", &self.visible)
            .field("found", &self.found)
            .field("replaced_by", &self.replaced_by)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
