//! Map - arena for keyframes and map points, plus the shared `MapStore`.
//!
//! The map owns every keyframe and map point and hands out integer handles.
//! Cross-entity maintenance lives here: bidirectional observation links,
//! covisibility recounting, spanning-tree attachment, replaced-by forwarding
//! and lazy tombstone reclamation.
//!
//! `MapStore` wraps the arena in the single map-update mutex. The tracker
//! holds the lock for a whole tick so the map is one consistent snapshot;
//! the mapping and loop-closing back-ends take the same lock around their
//! mutations.

use std::collections::HashMap;

use nalgebra::Vector3;
use parking_lot::{Mutex, MutexGuard};

use crate::features::Descriptor;
use crate::tracking::frame::Frame;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Minimum shared-point count for a covisibility edge.
const COVISIBILITY_THRESHOLD: usize = 15;

/// The landmark map shared between tracking and the back-ends.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    next_kf_id: u64,
    next_mp_id: u64,

    /// Map points of the current local map, published for viewers.
    reference_map_points: Vec<MapPointId>,

    /// First keyframe(s); survive back-end culling.
    keyframe_origins: Vec<KeyFrameId>,

    /// ORB pyramid parameters used for scale-dependent queries.
    pub scale_factor: f64,
    pub n_levels: u32,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            reference_map_points: Vec::new(),
            keyframe_origins: Vec::new(),
            scale_factor: 1.2,
            n_levels: 8,
        }
    }

    pub fn with_orb_params(scale_factor: f64, n_levels: u32) -> Self {
        Self {
            scale_factor,
            n_levels,
            ..Self::new()
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keyframes
    // ─────────────────────────────────────────────────────────────────────

    /// Promote a frame into a keyframe, snapshotting its features, pose and
    /// map-point slots. Returns None when the frame has no pose yet.
    pub fn promote_frame(&mut self, frame: &Frame) -> Option<KeyFrameId> {
        let pose = frame.pose.clone()?;
        let id = KeyFrameId(self.next_kf_id);
        self.next_kf_id += 1;

        let mut kf = KeyFrame::new(
            id,
            frame.id,
            frame.timestamp,
            pose,
            frame.camera,
            frame.keypoints_un.clone(),
            frame.descriptors.clone(),
            frame.depths.clone(),
            frame.map_points.clone(),
        );
        if self.keyframes.is_empty() {
            kf.origin = true;
            self.keyframe_origins.push(id);
        }
        self.keyframes.insert(id, kf);
        Some(id)
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes_in_map(&self) -> usize {
        self.keyframes.len()
    }

    /// All keyframe ids, oldest first.
    pub fn all_keyframes(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self.keyframes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn keyframe_origins(&self) -> &[KeyFrameId] {
        &self.keyframe_origins
    }

    // ─────────────────────────────────────────────────────────────────────
    // Map points
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf: Option<KeyFrameId>,
    ) -> MapPointId {
        let id = MapPointId(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf));
        id
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    /// A live (present and not tombstoned) map point.
    pub fn live_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id).filter(|mp| !mp.is_bad)
    }

    pub fn map_points_in_map(&self) -> usize {
        self.map_points.len()
    }

    pub fn all_map_points(&self) -> Vec<MapPointId> {
        let mut ids: Vec<MapPointId> = self.map_points.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Remove a point from the arena, clearing the slots of its observers.
    /// Used for the tracker's per-tick temporal points.
    pub fn remove_map_point(&mut self, id: MapPointId) {
        if let Some(mp) = self.map_points.remove(&id) {
            for (kf_id, idx) in mp.observations {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_map_point(idx);
                }
            }
        }
    }

    /// Follow the replaced-by forwarder one hop.
    ///
    /// Returns the id the caller should use instead, or None when the point
    /// no longer exists at all.
    pub fn resolve_replacement(&self, id: MapPointId) -> Option<MapPointId> {
        let mp = self.map_points.get(&id)?;
        Some(mp.replaced_by.unwrap_or(id))
    }

    /// Fuse `old` into `new`: transfer observations and counters, tombstone
    /// `old` and leave the forwarder behind. Back-end operation.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new || !self.map_points.contains_key(&new) {
            return;
        }
        let Some(old_mp) = self.map_points.get_mut(&old) else {
            return;
        };
        old_mp.is_bad = true;
        old_mp.replaced_by = Some(new);
        let observations: Vec<(KeyFrameId, usize)> =
            old_mp.observations.drain().collect();
        let (visible, found) = (old_mp.visible, old_mp.found);

        for (kf_id, idx) in observations {
            let already_observed = self
                .map_points
                .get(&new)
                .map(|mp| mp.observations.contains_key(&kf_id))
                .unwrap_or(false);
            if already_observed {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_map_point(idx);
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_map_point(idx, new);
                }
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.add_observation(kf_id, idx);
                }
            }
        }
        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.visible += visible;
            mp.found += found;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observation graph maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Bidirectional link between a keyframe slot and a map point.
    pub fn associate(&mut self, kf_id: KeyFrameId, keypoint_idx: usize, mp_id: MapPointId) {
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(keypoint_idx, mp_id);
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, keypoint_idx);
        }
    }

    /// Register observations for every filled slot of a keyframe. Used right
    /// after promotion so slots inherited from tracking become bidirectional.
    pub fn register_observations(&mut self, kf_id: KeyFrameId) {
        let slots: Vec<(usize, MapPointId)> = match self.keyframes.get(&kf_id) {
            Some(kf) => kf.map_point_indices().collect(),
            None => return,
        };
        for (idx, mp_id) in slots {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                if !mp.is_bad {
                    mp.add_observation(kf_id, idx);
                }
            }
        }
    }

    /// Recount covisibility edges for a keyframe and attach it to the
    /// spanning tree if it is not yet attached.
    ///
    /// Edges below the weight threshold are dropped unless no edge passes,
    /// in which case the single best neighbor is kept.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let slots: Vec<MapPointId> = match self.keyframes.get(&kf_id) {
            Some(kf) => kf.map_point_indices().map(|(_, id)| id).collect(),
            None => return,
        };

        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for mp_id in slots {
            let Some(mp) = self.map_points.get(&mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            for (&other, _) in &mp.observations {
                if other != kf_id {
                    *counter.entry(other).or_insert(0) += 1;
                }
            }
        }

        let Some((&best_kf, &best_weight)) = counter
            .iter()
            .max_by_key(|(id, w)| (**w, std::cmp::Reverse(**id)))
        else {
            return;
        };

        let mut edges: Vec<(KeyFrameId, usize)> = counter
            .iter()
            .filter(|(_, &w)| w >= COVISIBILITY_THRESHOLD)
            .map(|(&id, &w)| (id, w))
            .collect();
        if edges.is_empty() {
            edges.push((best_kf, best_weight));
        }

        for &(other, weight) in &edges {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_covisibility(other, weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.set_covisibility(kf_id, weight);
            }
        }

        let needs_parent = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.parent.is_none() && !kf.origin)
            .unwrap_or(false);
        if needs_parent {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_parent(best_kf);
            }
            if let Some(parent) = self.keyframes.get_mut(&best_kf) {
                parent.add_child(kf_id);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Count slots of `kf_id` whose map point is live and observed by at
    /// least `min_obs` keyframes.
    pub fn tracked_map_points(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return 0;
        };
        kf.map_point_indices()
            .filter(|(_, mp_id)| {
                self.live_map_point(*mp_id)
                    .map(|mp| mp.num_observations() >= min_obs)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Median depth of the map points seen by `kf_id`, in its camera frame.
    pub fn scene_median_depth(&self, kf_id: KeyFrameId) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let rot = kf.pose.rotation_matrix();
        let row2 = rot.row(2).transpose();
        let z_offset = kf.pose.translation.z;

        let mut depths: Vec<f64> = kf
            .map_point_indices()
            .filter_map(|(_, mp_id)| self.map_points.get(&mp_id))
            .map(|mp| row2.dot(&mp.position) + z_offset)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.total_cmp(b));
        Some(depths[(depths.len() - 1) / 2])
    }

    pub fn set_reference_map_points(&mut self, points: Vec<MapPointId>) {
        self.reference_map_points = points;
    }

    pub fn reference_map_points(&self) -> &[MapPointId] {
        &self.reference_map_points
    }

    /// Drop everything and restart handle numbering.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.reference_map_points.clear();
        self.keyframe_origins.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("keyframes", &self.keyframes.len())
            .field("map_points", &self.map_points.len())
            .finish()
    }
}

/// The shared map behind its update mutex.
///
/// Locking grants a consistent snapshot for the duration of the guard; the
/// tracker keeps it for a full tick, the back-ends for each mutation batch.
pub struct MapStore {
    inner: Mutex<Map>,
}

impl MapStore {
    pub fn new(map: Map) -> Self {
        Self {
            inner: Mutex::new(map),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Map> {
        self.inner.lock()
    }
}

impl Default for MapStore {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::features::KeyPoint;
    use crate::geometry::SE3;
    use crate::map::types::FrameId;
    use crate::tracking::frame::Frame;

    fn frame_with_slots(id: u64, n: usize) -> Frame {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let keypoints = vec![KeyPoint::new(10.0, 10.0, 0); n];
        let mut frame = Frame::new(
            FrameId(id),
            id as f64 * 0.033,
            camera,
            keypoints.clone(),
            keypoints,
            vec![[0u8; 32]; n],
            vec![-1.0; n],
            0.0,
        );
        frame.set_pose(SE3::identity());
        frame
    }

    fn map_with_keyframe(slots: usize) -> (Map, KeyFrameId) {
        let mut map = Map::new();
        let kf = map.promote_frame(&frame_with_slots(0, slots)).unwrap();
        (map, kf)
    }

    #[test]
    fn test_promote_requires_pose() {
        let mut map = Map::new();
        let mut frame = frame_with_slots(0, 4);
        frame.pose = None;
        assert!(map.promote_frame(&frame).is_none());
        assert_eq!(map.keyframes_in_map(), 0);
    }

    #[test]
    fn test_first_keyframe_is_origin() {
        let (map, kf) = map_with_keyframe(4);
        assert!(map.keyframe(kf).unwrap().origin);
        assert_eq!(map.keyframe_origins(), &[kf]);
    }

    #[test]
    fn test_associate_is_bidirectional() {
        let (mut map, kf) = map_with_keyframe(8);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], Some(kf));
        map.associate(kf, 3, mp);

        assert_eq!(map.keyframe(kf).unwrap().map_point(3), Some(mp));
        assert_eq!(
            map.map_point(mp).unwrap().observations.get(&kf),
            Some(&3usize)
        );
    }

    #[test]
    fn test_remove_map_point_clears_slots() {
        let (mut map, kf) = map_with_keyframe(8);
        let mp = map.create_map_point(Vector3::zeros(), [0u8; 32], Some(kf));
        map.associate(kf, 1, mp);

        map.remove_map_point(mp);
        assert!(map.map_point(mp).is_none());
        assert_eq!(map.keyframe(kf).unwrap().map_point(1), None);
    }

    #[test]
    fn test_replace_forwards_and_transfers() {
        let mut map = Map::new();
        let kf_a = map.promote_frame(&frame_with_slots(0, 8)).unwrap();
        let kf_b = map.promote_frame(&frame_with_slots(1, 8)).unwrap();

        let old = map.create_map_point(Vector3::new(0.0, 0.0, 1.0), [0u8; 32], Some(kf_a));
        let new = map.create_map_point(Vector3::new(0.0, 0.0, 1.01), [0u8; 32], Some(kf_b));
        map.associate(kf_a, 0, old);
        map.associate(kf_b, 0, new);
        map.map_point_mut(old).unwrap().visible = 5;
        map.map_point_mut(old).unwrap().found = 3;

        map.replace_map_point(old, new);

        // Forwarder left behind, observation moved over.
        assert_eq!(map.resolve_replacement(old), Some(new));
        assert!(map.map_point(old).unwrap().is_bad);
        assert_eq!(map.keyframe(kf_a).unwrap().map_point(0), Some(new));
        assert_eq!(map.map_point(new).unwrap().num_observations(), 2);
        assert_eq!(map.map_point(new).unwrap().visible, 5);
        assert_eq!(map.map_point(new).unwrap().found, 3);
    }

    #[test]
    fn test_update_connections_builds_covisibility_and_tree() {
        let mut map = Map::new();
        let kf_a = map.promote_frame(&frame_with_slots(0, 40)).unwrap();
        let kf_b = map.promote_frame(&frame_with_slots(1, 40)).unwrap();

        // 20 shared points: above the edge threshold.
        for i in 0..20 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], Some(kf_a));
            map.associate(kf_a, i, mp);
            map.associate(kf_b, i, mp);
        }
        map.update_connections(kf_b);

        assert_eq!(map.keyframe(kf_a).unwrap().covisibility_weight(kf_b), 20);
        assert_eq!(map.keyframe(kf_b).unwrap().covisibility_weight(kf_a), 20);
        assert_eq!(map.keyframe(kf_b).unwrap().parent, Some(kf_a));
        assert!(map.keyframe(kf_a).unwrap().children.contains(&kf_b));
    }

    #[test]
    fn test_update_connections_keeps_best_below_threshold() {
        let mut map = Map::new();
        let kf_a = map.promote_frame(&frame_with_slots(0, 10)).unwrap();
        let kf_b = map.promote_frame(&frame_with_slots(1, 10)).unwrap();

        for i in 0..3 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], Some(kf_a));
            map.associate(kf_a, i, mp);
            map.associate(kf_b, i, mp);
        }
        map.update_connections(kf_b);

        // Only three shared points, still a single kept edge.
        assert_eq!(map.keyframe(kf_b).unwrap().covisibility_weight(kf_a), 3);
    }

    #[test]
    fn test_tracked_map_points_respects_min_obs() {
        let (mut map, kf) = map_with_keyframe(8);
        let mp = map.create_map_point(Vector3::zeros(), [0u8; 32], Some(kf));
        map.associate(kf, 0, mp);
        assert_eq!(map.tracked_map_points(kf, 1), 1);
        assert_eq!(map.tracked_map_points(kf, 2), 0);

        map.map_point_mut(mp).unwrap().set_bad();
        assert_eq!(map.tracked_map_points(kf, 1), 0);
    }

    #[test]
    fn test_scene_median_depth() {
        let (mut map, kf) = map_with_keyframe(8);
        for (i, z) in [1.0, 2.0, 3.0, 4.0, 5.0].iter().enumerate() {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, *z), [0u8; 32], Some(kf));
            map.associate(kf, i, mp);
        }
        let median = map.scene_median_depth(kf).unwrap();
        assert!((median - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_clear_resets_ids() {
        let (mut map, _) = map_with_keyframe(4);
        map.clear();
        assert_eq!(map.keyframes_in_map(), 0);
        let kf = map.promote_frame(&frame_with_slots(0, 4)).unwrap();
        assert_eq!(kf, KeyFrameId(0));
    }
}
