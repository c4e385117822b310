//! Per-frame snapshot of the keyframes and map points near the camera.
//!
//! The local map is rebuilt every tick: keyframes observing the currently
//! tracked points vote themselves in, the neighborhood is expanded once
//! through the covisibility graph and the spanning tree, and the union of
//! their map points becomes the projection-search candidate set.

use std::collections::BTreeMap;

use tracing::trace;

use crate::map::{KeyFrameId, Map, MapPointId};

use super::frame::Frame;

/// Hard cap on the local keyframe set.
const MAX_LOCAL_KEYFRAMES: usize = 80;

/// How many top covisible neighbors are considered per seeded keyframe.
const NEIGHBOR_CANDIDATES: usize = 10;

/// Bounded view of the map around the current frame.
#[derive(Debug, Default)]
pub struct LocalMapCache {
    /// Local keyframes in insertion order.
    pub keyframes: Vec<KeyFrameId>,
    /// Deduplicated map points observed by the local keyframes.
    pub points: Vec<MapPointId>,
}

impl LocalMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache directly, used right after initialization.
    pub fn seed(&mut self, keyframes: Vec<KeyFrameId>, points: Vec<MapPointId>) {
        self.keyframes = keyframes;
        self.points = points;
    }

    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.points.clear();
    }

    /// Rebuild the local keyframe and point sets for `frame`.
    ///
    /// Returns the keyframe sharing the most points with the frame, which
    /// becomes the new reference keyframe. Bad map points encountered in the
    /// frame's slots are swept to empty.
    pub fn update(&mut self, frame: &mut Frame, map: &mut Map) -> Option<KeyFrameId> {
        let reference = self.update_local_keyframes(frame, map);
        self.update_local_points(frame, map);
        map.set_reference_map_points(self.points.clone());
        trace!(
            frame = %frame.id,
            keyframes = self.keyframes.len(),
            points = self.points.len(),
            "local map updated"
        );
        reference
    }

    fn update_local_keyframes(&mut self, frame: &mut Frame, map: &mut Map) -> Option<KeyFrameId> {
        // Each tracked map point votes for every keyframe observing it.
        let mut votes: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        for slot in frame.map_points.iter_mut() {
            let Some(mp_id) = *slot else {
                continue;
            };
            match map.map_point(mp_id) {
                Some(mp) if !mp.is_bad => {
                    for &kf_id in mp.observations.keys() {
                        *votes.entry(kf_id).or_insert(0) += 1;
                    }
                }
                _ => *slot = None,
            }
        }

        if votes.is_empty() {
            return None;
        }

        self.keyframes.clear();

        let mut best: Option<KeyFrameId> = None;
        let mut max_votes = 0usize;

        // Seed with every voted keyframe.
        for (&kf_id, &n) in &votes {
            let Some(kf) = map.keyframe_mut(kf_id) else {
                continue;
            };
            if kf.is_bad {
                continue;
            }
            if n > max_votes {
                max_votes = n;
                best = Some(kf_id);
            }
            kf.track_reference_for_frame = Some(frame.id);
            self.keyframes.push(kf_id);
        }

        // Expand once: per seeded keyframe take at most one unseen
        // best-covisibility neighbor, at most one unseen spanning-tree child,
        // and the parent.
        let seeded = self.keyframes.clone();
        for kf_id in seeded {
            if self.keyframes.len() > MAX_LOCAL_KEYFRAMES {
                break;
            }

            let neighbors = match map.keyframe_mut(kf_id) {
                Some(kf) => kf.best_covisibles(NEIGHBOR_CANDIDATES),
                None => continue,
            };
            for neighbor_id in neighbors {
                if self.try_add(neighbor_id, frame, map) {
                    break;
                }
            }

            let mut children: Vec<KeyFrameId> = match map.keyframe(kf_id) {
                Some(kf) => kf.children.iter().copied().collect(),
                None => continue,
            };
            children.sort();
            for child_id in children {
                if self.try_add(child_id, frame, map) {
                    break;
                }
            }

            if let Some(parent_id) = map.keyframe(kf_id).and_then(|kf| kf.parent) {
                self.try_add(parent_id, frame, map);
            }
        }

        best
    }

    /// Add a keyframe unless it is bad or already tagged for this frame.
    fn try_add(&mut self, kf_id: KeyFrameId, frame: &Frame, map: &mut Map) -> bool {
        let Some(kf) = map.keyframe_mut(kf_id) else {
            return false;
        };
        if kf.is_bad || kf.track_reference_for_frame == Some(frame.id) {
            return false;
        }
        kf.track_reference_for_frame = Some(frame.id);
        self.keyframes.push(kf_id);
        true
    }

    fn update_local_points(&mut self, frame: &Frame, map: &mut Map) {
        self.points.clear();

        for &kf_id in &self.keyframes {
            let slots: Vec<MapPointId> = match map.keyframe(kf_id) {
                Some(kf) => kf.map_point_indices().map(|(_, id)| id).collect(),
                None => continue,
            };
            for mp_id in slots {
                let Some(mp) = map.map_point_mut(mp_id) else {
                    continue;
                };
                if mp.track_reference_for_frame == Some(frame.id) || mp.is_bad {
                    continue;
                }
                mp.track_reference_for_frame = Some(frame.id);
                self.points.push(mp_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::features::KeyPoint;
    use crate::geometry::SE3;
    use crate::map::FrameId;
    use nalgebra::Vector3;

    fn frame_with_slots(id: u64, n: usize) -> Frame {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let kps = vec![KeyPoint::new(10.0, 10.0, 0); n];
        let mut f = Frame::new(
            FrameId(id),
            0.0,
            camera,
            kps.clone(),
            kps,
            vec![[0u8; 32]; n],
            vec![-1.0; n],
            3.0,
        );
        f.set_pose(SE3::identity());
        f
    }

    /// Three keyframes: A and B share points with the frame, C is only a
    /// covisibility neighbor of A.
    fn build_map() -> (Map, Vec<KeyFrameId>, Vec<MapPointId>) {
        let mut map = Map::new();
        let kf_ids: Vec<KeyFrameId> = (0..3)
            .map(|i| map.promote_frame(&frame_with_slots(i, 30)).unwrap())
            .collect();

        let mut mps = Vec::new();
        for i in 0..6 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], Some(kf_ids[0]));
            map.associate(kf_ids[0], i, mp);
            mps.push(mp);
        }
        // B shares the first two points.
        map.associate(kf_ids[1], 0, mps[0]);
        map.associate(kf_ids[1], 1, mps[1]);
        // C shares nothing with the frame but is covisible with A.
        let shared = map.create_map_point(Vector3::new(0.0, 0.0, 3.0), [0u8; 32], Some(kf_ids[0]));
        map.associate(kf_ids[0], 10, shared);
        map.associate(kf_ids[2], 10, shared);
        map.update_connections(kf_ids[1]);
        map.update_connections(kf_ids[2]);

        (map, kf_ids, mps)
    }

    #[test]
    fn test_reference_is_top_voted() {
        let (mut map, kf_ids, mps) = build_map();
        let mut frame = frame_with_slots(10, 30);
        // Frame tracks 4 points of A, 2 shared with B.
        for (i, mp) in mps.iter().take(4).enumerate() {
            frame.map_points[i] = Some(*mp);
        }

        let mut cache = LocalMapCache::new();
        let reference = cache.update(&mut frame, &mut map);

        assert_eq!(reference, Some(kf_ids[0]));
        // A and B voted; C pulled in through expansion.
        assert!(cache.keyframes.contains(&kf_ids[0]));
        assert!(cache.keyframes.contains(&kf_ids[1]));
        assert!(cache.keyframes.contains(&kf_ids[2]));
    }

    #[test]
    fn test_local_points_deduplicated_and_subset_of_keyframes() {
        let (mut map, kf_ids, mps) = build_map();
        let mut frame = frame_with_slots(10, 30);
        frame.map_points[0] = Some(mps[0]);
        frame.map_points[1] = Some(mps[1]);

        let mut cache = LocalMapCache::new();
        cache.update(&mut frame, &mut map);

        let mut sorted = cache.points.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), cache.points.len(), "points must be unique");

        // Every local point is observed by some local keyframe.
        for mp_id in &cache.points {
            let mp = map.map_point(*mp_id).unwrap();
            assert!(
                mp.observations
                    .keys()
                    .any(|kf| cache.keyframes.contains(kf)),
                "{mp_id} not observed by any local keyframe"
            );
        }
        let _ = kf_ids;
    }

    #[test]
    fn test_bad_points_swept_from_frame() {
        let (mut map, _, mps) = build_map();
        let mut frame = frame_with_slots(10, 30);
        frame.map_points[0] = Some(mps[0]);
        map.map_point_mut(mps[0]).unwrap().set_bad();

        let mut cache = LocalMapCache::new();
        cache.update(&mut frame, &mut map);
        assert_eq!(frame.map_points[0], None);
    }

    #[test]
    fn test_empty_votes_keeps_previous_reference() {
        let (mut map, _, _) = build_map();
        let mut frame = frame_with_slots(10, 30);

        let mut cache = LocalMapCache::new();
        assert_eq!(cache.update(&mut frame, &mut map), None);
    }
}
