//! KeyFrame - a frame promoted into the map graph.
//!
//! Keyframes are the anchors of the observation graph. Each one keeps its
//! feature snapshot, its map-point slots, the weighted covisibility adjacency
//! and its spanning-tree links. Graph maintenance that needs both endpoints
//! (covisibility recounting, spanning-tree attachment) lives on `Map`.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::camera::CameraModel;
use crate::features::{Descriptor, KeyPoint};
use crate::geometry::SE3;

use super::types::{FrameId, KeyFrameId, MapPointId};

/// A keyframe in the map.
#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Frame this keyframe was promoted from.
    pub source_frame: FrameId,

    pub timestamp: f64,

    /// World-to-camera pose (Tcw).
    pub pose: SE3,

    pub camera: CameraModel,

    /// Undistorted keypoints and their descriptors.
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,

    /// Per-keypoint depth in meters; negative for monocular detections.
    pub depths: Vec<f32>,

    /// Keypoint index → map point association.
    pub map_points: Vec<Option<MapPointId>>,

    /// Covisibility adjacency: neighbor keyframe → shared map-point count.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Cached neighbors ordered by weight (best first); rebuilt when dirty.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,
    covisibility_dirty: bool,

    /// Spanning tree links.
    pub parent: Option<KeyFrameId>,
    pub children: HashSet<KeyFrameId>,

    /// First keyframe of its map (never culled by the back-end).
    pub origin: bool,

    pub is_bad: bool,

    /// Tag preventing re-insertion into the local map within one tick.
    pub track_reference_for_frame: Option<FrameId>,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        source_frame: FrameId,
        timestamp: f64,
        pose: SE3,
        camera: CameraModel,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        depths: Vec<f32>,
        map_points: Vec<Option<MapPointId>>,
    ) -> Self {
        Self {
            id,
            source_frame,
            timestamp,
            pose,
            camera,
            keypoints,
            descriptors,
            depths,
            map_points,
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            parent: None,
            children: HashSet::new(),
            origin: false,
            is_bad: false,
            track_reference_for_frame: None,
        }
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.camera_center()
    }

    /// Camera-to-world transform (Twc).
    pub fn pose_inverse(&self) -> SE3 {
        self.pose.inverse()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Map point slots
    // ─────────────────────────────────────────────────────────────────────

    pub fn map_point(&self, keypoint_idx: usize) -> Option<MapPointId> {
        self.map_points.get(keypoint_idx).copied().flatten()
    }

    pub fn set_map_point(&mut self, keypoint_idx: usize, mp_id: MapPointId) {
        if keypoint_idx < self.map_points.len() {
            self.map_points[keypoint_idx] = Some(mp_id);
        }
    }

    pub fn erase_map_point(&mut self, keypoint_idx: usize) -> Option<MapPointId> {
        self.map_points.get_mut(keypoint_idx).and_then(Option::take)
    }

    pub fn map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_points
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility graph
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.covisibility_dirty = true;
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// The `n` neighbors sharing the most map points, best first.
    pub fn best_covisibles(&mut self, n: usize) -> Vec<KeyFrameId> {
        self.ensure_ordered_covisibles();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    fn ensure_ordered_covisibles(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        // Order by weight, then id, so iteration is deterministic.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Spanning tree
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent: KeyFrameId) {
        self.parent = Some(parent);
    }

    pub fn add_child(&mut self, child: KeyFrameId) {
        self.children.insert(child);
    }

    pub fn erase_child(&mut self, child: KeyFrameId) {
        self.children.remove(&child);
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("source_frame", &self.source_frame)
            .field("keypoints", &self.keypoints.len())
            .field("map_points", &self.map_point_indices().count())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keyframe(id: u64, slots: usize) -> KeyFrame {
        KeyFrame::new(
            KeyFrameId(id),
            FrameId(id),
            id as f64 * 0.033,
            SE3::identity(),
            CameraModel::new(500.0, 500.0, 320.0, 240.0, 640, 480),
            vec![KeyPoint::new(0.0, 0.0, 0); slots],
            vec![[0u8; 32]; slots],
            vec![-1.0; slots],
            vec![None; slots],
        )
    }

    #[test]
    fn test_slot_roundtrip() {
        let mut kf = test_keyframe(1, 10);
        kf.set_map_point(3, MapPointId(100));
        assert_eq!(kf.map_point(3), Some(MapPointId(100)));
        assert_eq!(kf.map_point(4), None);

        assert_eq!(kf.erase_map_point(3), Some(MapPointId(100)));
        assert_eq!(kf.map_point(3), None);
        assert_eq!(kf.erase_map_point(99), None);
    }

    #[test]
    fn test_best_covisibles_ordering() {
        let mut kf = test_keyframe(0, 0);
        kf.set_covisibility(KeyFrameId(2), 50);
        kf.set_covisibility(KeyFrameId(3), 100);
        kf.set_covisibility(KeyFrameId(4), 25);

        let best = kf.best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId(3), KeyFrameId(2)]);

        kf.erase_covisibility(KeyFrameId(3));
        let best = kf.best_covisibles(10);
        assert_eq!(best, vec![KeyFrameId(2), KeyFrameId(4)]);
    }

    #[test]
    fn test_no_self_edge() {
        let mut kf = test_keyframe(7, 0);
        kf.set_covisibility(KeyFrameId(7), 10);
        assert_eq!(kf.covisibility_weight(KeyFrameId(7)), 0);
    }
}
