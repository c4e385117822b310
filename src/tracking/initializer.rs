//! Map bootstrap: stereo/RGB-D one-shot and monocular two-view paths.
//!
//! The monocular initializer is a short-lived object owned by the engine
//! while tracking is in `NotInitialized`; it is destroyed on success or
//! abandonment. The stereo path needs no state: one dense-depth frame is
//! enough to build the first keyframe and its points.

use nalgebra::Point2;
use tracing::{info, warn};

use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map};
use crate::system::{DescriptorMatcher, MonoInitializer, Optimizer, TwoViewGeometry};

use super::frame::Frame;

/// Minimum keypoints for the stereo/RGB-D one-shot path.
const STEREO_MIN_KEYPOINTS: usize = 500;

/// Minimum keypoints to start or continue monocular initialization.
pub(crate) const MONO_MIN_KEYPOINTS: usize = 100;

/// Minimum two-view correspondences.
const MONO_MIN_MATCHES: usize = 100;

/// Search window (pixels) for initialization matching.
const MONO_SEARCH_WINDOW: u32 = 100;

/// Iterations of the post-initialization bundle adjustment.
const INITIAL_BA_ITERATIONS: usize = 20;

/// One-shot initialization from a frame with sensor depth.
///
/// Creates the first keyframe at the origin and a map point for every
/// keypoint with positive depth. Returns None when the frame has too few
/// keypoints; above the threshold it always succeeds.
pub fn stereo_initialize(frame: &mut Frame, map: &mut Map) -> Option<KeyFrameId> {
    if frame.n() <= STEREO_MIN_KEYPOINTS {
        return None;
    }

    frame.set_pose(SE3::identity());
    let kf_id = map.promote_frame(frame)?;

    let center = frame.pose.as_ref().map(SE3::camera_center).unwrap_or_default();
    let (scale_factor, n_levels) = (map.scale_factor, map.n_levels);

    for i in 0..frame.n() {
        if frame.depths[i] <= 0.0 {
            continue;
        }
        let Some(position) = frame.unproject_keypoint(i) else {
            continue;
        };
        let mp_id = map.create_map_point(position, frame.descriptors[i], Some(kf_id));
        map.associate(kf_id, i, mp_id);
        if let Some(mp) = map.map_point_mut(mp_id) {
            mp.update_normal_and_depth(std::iter::once(&center), scale_factor, n_levels);
        }
        frame.map_points[i] = Some(mp_id);
    }

    info!(points = map.map_points_in_map(), "new map created");
    Some(kf_id)
}

/// Result of one monocular initialization attempt.
pub enum MonoInitOutcome {
    /// Keep the pending initializer and try again next frame.
    Pending,
    /// Too few correspondences: discard the pending initializer.
    Abandoned,
    /// Triangulation or scale normalization rejected: full reset required.
    Failed,
    /// The initial two-keyframe map exists.
    Initialized {
        initial_kf: KeyFrameId,
        current_kf: KeyFrameId,
    },
}

/// Pending two-view initialization state.
pub struct MonocularInitializer {
    /// The stored reference view.
    reference: Frame,
    /// Last matched position per reference keypoint, fed back to the matcher.
    prev_matched: Vec<Point2<f32>>,
    /// Reference keypoint index → current keypoint index, -1 when unmatched.
    matches: Vec<i32>,
}

impl MonocularInitializer {
    pub fn new(reference: Frame) -> Self {
        let prev_matched = reference.keypoints_un.iter().map(|kp| kp.pt).collect();
        let n = reference.keypoints_un.len();
        Self {
            reference,
            prev_matched,
            matches: vec![-1; n],
        }
    }

    pub fn reference(&self) -> &Frame {
        &self.reference
    }

    /// Try to initialize against `frame`.
    pub fn attempt(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
        matcher: &dyn DescriptorMatcher,
        two_view: &dyn MonoInitializer,
        optimizer: &dyn Optimizer,
    ) -> MonoInitOutcome {
        let n_matches = matcher.search_for_initialization(
            &self.reference,
            frame,
            &mut self.prev_matched,
            &mut self.matches,
            MONO_SEARCH_WINDOW,
        );
        if n_matches < MONO_MIN_MATCHES {
            return MonoInitOutcome::Abandoned;
        }

        let Some(geometry) = two_view.initialize(&self.reference, frame, &self.matches) else {
            return MonoInitOutcome::Pending;
        };

        // Keep only correspondences that triangulated.
        for (i, m) in self.matches.iter_mut().enumerate() {
            if *m >= 0 && !geometry.triangulated.get(i).copied().unwrap_or(false) {
                *m = -1;
            }
        }

        self.reference.set_pose(SE3::identity());
        frame.set_pose(geometry.pose.clone());

        match self.create_initial_map(frame, map, &geometry, optimizer) {
            Some((initial_kf, current_kf)) => MonoInitOutcome::Initialized {
                initial_kf,
                current_kf,
            },
            None => MonoInitOutcome::Failed,
        }
    }

    /// Build the two keyframes and their points, bundle-adjust and normalize
    /// the scale so the median scene depth becomes one.
    fn create_initial_map(
        &self,
        frame: &mut Frame,
        map: &mut Map,
        geometry: &TwoViewGeometry,
        optimizer: &dyn Optimizer,
    ) -> Option<(KeyFrameId, KeyFrameId)> {
        let initial_kf = map.promote_frame(&self.reference)?;
        let current_kf = map.promote_frame(frame)?;

        let centers = [
            map.keyframe(initial_kf)?.camera_center(),
            map.keyframe(current_kf)?.camera_center(),
        ];
        let (scale_factor, n_levels) = (map.scale_factor, map.n_levels);

        for (i, &m) in self.matches.iter().enumerate() {
            if m < 0 {
                continue;
            }
            let cur_idx = m as usize;
            let Some(&position) = geometry.points.get(i) else {
                continue;
            };
            let mp_id = map.create_map_point(position, frame.descriptors[cur_idx], Some(current_kf));
            map.associate(initial_kf, i, mp_id);
            map.associate(current_kf, cur_idx, mp_id);
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.update_normal_and_depth(centers.iter(), scale_factor, n_levels);
            }
            frame.map_points[cur_idx] = Some(mp_id);
            frame.outlier[cur_idx] = false;
        }

        map.update_connections(initial_kf);
        map.update_connections(current_kf);

        info!(points = map.map_points_in_map(), "new map created");

        optimizer.global_bundle_adjustment(map, INITIAL_BA_ITERATIONS);

        let median_depth = map.scene_median_depth(initial_kf).unwrap_or(-1.0);
        if median_depth <= 0.0 || map.tracked_map_points(current_kf, 1) < 100 {
            warn!(median_depth, "wrong initialization");
            return None;
        }

        // Normalize: median depth becomes 1.
        let inv_median = 1.0 / median_depth;
        if let Some(kf) = map.keyframe_mut(current_kf) {
            kf.pose = kf.pose.scaled_translation(inv_median);
        }
        let point_ids: Vec<_> = map
            .keyframe(initial_kf)?
            .map_point_indices()
            .map(|(_, id)| id)
            .collect();
        for mp_id in point_ids {
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.position *= inv_median;
            }
        }

        frame.set_pose(map.keyframe(current_kf)?.pose.clone());
        Some((initial_kf, current_kf))
    }
}
