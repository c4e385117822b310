//! Keyframe insertion policy.
//!
//! Stateless evaluation of whether the current frame should be promoted to a
//! keyframe, balancing map density against back-end load. Temporal windows
//! (`min_frames`/`max_frames`) come from the camera frame rate.

use tracing::trace;

use crate::config::Sensor;
use crate::map::{KeyFrameId, Map};
use crate::system::LocalMapping;

use super::frame::Frame;

/// Everything the policy looks at for one decision.
pub struct KeyframeQuery<'a> {
    pub frame: &'a Frame,
    pub map: &'a Map,
    pub mapper: &'a dyn LocalMapping,
    pub sensor: Sensor,
    pub reference_kf: Option<KeyFrameId>,
    /// Inliers from local-map tracking this tick.
    pub matches_inliers: usize,
    /// Frame id at which the last keyframe was inserted.
    pub last_keyframe_frame: u64,
    /// Frame id of the last relocalization.
    pub last_reloc_frame: u64,
}

/// Stateless keyframe decision.
#[derive(Debug, Clone)]
pub struct KeyframePolicy {
    pub max_frames: u64,
    pub min_frames: u64,
}

impl KeyframePolicy {
    pub fn new(max_frames: u64, min_frames: u64) -> Self {
        Self {
            max_frames,
            min_frames,
        }
    }

    pub fn need_new_keyframe(&self, q: &KeyframeQuery<'_>) -> bool {
        // A back-end frozen by loop closure takes no keyframes.
        if q.mapper.is_stopped() || q.mapper.stop_requested() {
            return false;
        }

        let frame_id = q.frame.id.0;
        let n_kfs = q.map.keyframes_in_map();

        // Hold off right after a relocalization in an established map.
        if frame_id < q.last_reloc_frame + self.max_frames && n_kfs as u64 > self.max_frames {
            return false;
        }

        let min_obs = if n_kfs <= 2 { 2 } else { 3 };
        let n_ref_matches = q
            .reference_kf
            .map(|kf| q.map.tracked_map_points(kf, min_obs))
            .unwrap_or(0);

        let mapper_idle = q.mapper.accept_keyframes();

        // Close points currently tracked vs. creatable from depth.
        let mut tracked_close = 0usize;
        let mut non_tracked_close = 0usize;
        if q.sensor != Sensor::Monocular {
            for i in 0..q.frame.n() {
                let z = q.frame.depths[i] as f64;
                if z > 0.0 && z < q.frame.close_depth {
                    if q.frame.map_points[i].is_some() && !q.frame.outlier[i] {
                        tracked_close += 1;
                    } else {
                        non_tracked_close += 1;
                    }
                }
            }
        }
        let need_close = tracked_close < 100 && non_tracked_close > 70;

        let ref_ratio = match q.sensor {
            Sensor::Monocular => 0.9,
            _ if n_kfs < 2 => 0.4,
            _ => 0.75,
        };

        let inliers = q.matches_inliers as f64;
        let n_ref = n_ref_matches as f64;

        // c1a: the insertion window expired.
        let c1a = frame_id >= q.last_keyframe_frame + self.max_frames;
        // c1b: minimum spacing passed and the back-end is idle.
        let c1b = frame_id >= q.last_keyframe_frame + self.min_frames && mapper_idle;
        // c1c: tracking is weak (depth sensors only).
        let c1c = q.sensor != Sensor::Monocular && (inliers < n_ref * 0.25 || need_close);
        // c2: reference overlap decayed but tracking still holds.
        let c2 = (inliers < n_ref * ref_ratio || need_close) && q.matches_inliers > 15;

        trace!(c1a, c1b, c1c, c2, n_ref_matches, "keyframe decision");

        if !((c1a || c1b || c1c) && c2) {
            return false;
        }

        if mapper_idle {
            return true;
        }

        q.mapper.interrupt_ba();
        if q.sensor != Sensor::Monocular {
            q.mapper.keyframes_in_queue() < 3
        } else {
            false
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
    use crate::system::LocalMapperLink;
    use nalgebra::Vector3;

    fn frame(id: u64, n: usize, close_depth: f64) -> Frame {
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
            close_depth,
        );
        f.set_pose(SE3::identity());
        f
    }

    /// Map with one keyframe tracking `n` well-observed points.
    fn map_with_reference(n: usize) -> (Map, KeyFrameId) {
        let mut map = Map::new();
        let kf = map.promote_frame(&frame(0, 200, 3.0)).unwrap();
        let kf2 = map.promote_frame(&frame(1, 200, 3.0)).unwrap();
        for i in 0..n {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], Some(kf));
            map.associate(kf, i, mp);
            map.associate(kf2, i, mp);
        }
        (map, kf)
    }

    fn policy() -> KeyframePolicy {
        KeyframePolicy::new(30, 0)
    }

    #[test]
    fn test_stopped_mapper_blocks_insertion() {
        let (map, kf) = map_with_reference(100);
        let mapper = LocalMapperLink::new();
        mapper.request_stop();
        mapper.try_stop();

        let f = frame(100, 200, 3.0);
        let q = KeyframeQuery {
            frame: &f,
            map: &map,
            mapper: &mapper,
            sensor: Sensor::Monocular,
            reference_kf: Some(kf),
            matches_inliers: 20,
            last_keyframe_frame: 0,
            last_reloc_frame: 0,
        };
        assert!(!policy().need_new_keyframe(&q));
    }

    #[test]
    fn test_weak_overlap_with_idle_mapper_inserts() {
        let (map, kf) = map_with_reference(100);
        let mapper = LocalMapperLink::new();

        // 20 inliers against 100 reference matches: well under 0.9 ratio.
        let f = frame(10, 200, 3.0);
        let q = KeyframeQuery {
            frame: &f,
            map: &map,
            mapper: &mapper,
            sensor: Sensor::Monocular,
            reference_kf: Some(kf),
            matches_inliers: 20,
            last_keyframe_frame: 0,
            last_reloc_frame: 0,
        };
        assert!(policy().need_new_keyframe(&q));
    }

    #[test]
    fn test_too_few_inliers_never_inserts() {
        let (map, kf) = map_with_reference(100);
        let mapper = LocalMapperLink::new();

        let f = frame(100, 200, 3.0);
        let q = KeyframeQuery {
            frame: &f,
            map: &map,
            mapper: &mapper,
            sensor: Sensor::Monocular,
            reference_kf: Some(kf),
            matches_inliers: 10,
            last_keyframe_frame: 0,
            last_reloc_frame: 0,
        };
        assert!(!policy().need_new_keyframe(&q));
    }

    #[test]
    fn test_busy_mapper_interrupts_ba_monocular() {
        let (map, kf) = map_with_reference(100);
        let mapper = LocalMapperLink::new();
        mapper.set_accept_keyframes(false);

        let f = frame(10, 200, 3.0);
        let q = KeyframeQuery {
            frame: &f,
            map: &map,
            mapper: &mapper,
            sensor: Sensor::Monocular,
            reference_kf: Some(kf),
            matches_inliers: 20,
            last_keyframe_frame: 0,
            last_reloc_frame: 0,
        };
        // Monocular never queues on a busy mapper, but it pokes BA.
        assert!(!policy().need_new_keyframe(&q));
        assert!(mapper.take_interrupt());
    }

    #[test]
    fn test_busy_mapper_rgbd_respects_queue_bound() {
        let (map, kf) = map_with_reference(100);
        let mapper = LocalMapperLink::new();
        mapper.set_accept_keyframes(false);

        let mut f = frame(10, 200, 3.0);
        // Plenty of close, untracked depth points.
        for d in f.depths.iter_mut().take(100) {
            *d = 1.0;
        }

        let q = KeyframeQuery {
            frame: &f,
            map: &map,
            mapper: &mapper,
            sensor: Sensor::RgbD,
            reference_kf: Some(kf),
            matches_inliers: 20,
            last_keyframe_frame: 0,
            last_reloc_frame: 0,
        };
        assert!(policy().need_new_keyframe(&q));

        for i in 0..3 {
            mapper.insert_keyframe(KeyFrameId(i));
        }
        assert!(!policy().need_new_keyframe(&q));
    }

    #[test]
    fn test_suppressed_after_recent_relocalization() {
        let (mut map, kf) = map_with_reference(100);
        // Grow the map beyond max_frames keyframes.
        for i in 2..40 {
            map.promote_frame(&frame(i, 10, 3.0)).unwrap();
        }
        let mapper = LocalMapperLink::new();

        let f = frame(110, 200, 3.0);
        let q = KeyframeQuery {
            frame: &f,
            map: &map,
            mapper: &mapper,
            sensor: Sensor::Monocular,
            reference_kf: Some(kf),
            matches_inliers: 20,
            last_keyframe_frame: 0,
            last_reloc_frame: 100,
        };
        assert!(!policy().need_new_keyframe(&q));
    }
}
