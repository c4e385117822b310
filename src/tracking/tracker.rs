//! Main tracking engine: state machine and per-frame driver.
//!
//! One call to [`TrackingEngine::process_frame`] runs a full tick under the
//! map-update lock: heal stale associations, estimate a coarse pose (motion
//! model, reference keyframe or relocalization), refine against the local
//! map, update bookkeeping and decide on keyframe promotion. Failures are
//! recoverable and surface as state transitions; the only escalation is a
//! full system reset when tracking is lost over a map too small to
//! relocalize in.

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::camera::CameraModel;
use crate::config::{Sensor, Settings};
use crate::geometry::SE3;
use crate::map::{FrameId, KeyFrameId, Map, MapPointId, MapStore};
use crate::system::{
    AlignTarget, DescriptorMatcher, FeatureExtractor, ImageAligner, LocalMapping, MonoInitializer,
    Optimizer, TrackingEvents, Viewer,
};

use super::TrackError;
use super::frame::{DepthMap, Frame, convert_grayscale};
use super::initializer::{MONO_MIN_KEYPOINTS, MonoInitOutcome, MonocularInitializer, stereo_initialize};
use super::keyframe_decision::{KeyframePolicy, KeyframeQuery};
use super::local_map::LocalMapCache;
use super::motion_model::MotionModel;
use super::state::TrackingState;
use super::trajectory::TrajectoryLog;

/// Default pixel radius of the coarse projection search.
const PROJECTION_RADIUS: u32 = 8;

/// Minimum matches after projection search (coarse tracking).
const MIN_COARSE_MATCHES: usize = 20;

/// Minimum map-backed inliers after pose optimization (coarse tracking).
const MIN_MAP_INLIERS: usize = 10;

/// Map size at or below which a lost track triggers a full reset.
const RESET_MAP_SIZE: usize = 5;

/// Poll interval while waiting for the viewer to stop during reset.
const VIEWER_STOP_POLL: Duration = Duration::from_millis(3);

/// External components the engine delegates to.
pub struct Collaborators {
    pub extractor: Box<dyn FeatureExtractor>,
    /// Extractor with a larger feature budget, used while a monocular map is
    /// being bootstrapped.
    pub init_extractor: Option<Box<dyn FeatureExtractor>>,
    pub matcher: Box<dyn DescriptorMatcher>,
    pub optimizer: Box<dyn Optimizer>,
    pub aligner: Box<dyn ImageAligner>,
    pub mono_initializer: Box<dyn MonoInitializer>,
    pub local_mapper: Arc<dyn LocalMapping>,
    pub viewer: Option<Arc<dyn Viewer>>,
    pub events: Option<Arc<dyn TrackingEvents>>,
}

/// The tracking front-end.
pub struct TrackingEngine {
    sensor: Sensor,
    camera: CameraModel,
    close_depth: f64,
    depth_map_factor: f64,
    rgb: bool,

    state: TrackingState,
    last_processed_state: TrackingState,

    next_frame_id: u64,
    last_frame: Option<Frame>,

    reference_kf: Option<KeyFrameId>,
    last_keyframe: Option<KeyFrameId>,
    /// Frame id at which the last keyframe was inserted.
    last_keyframe_frame: u64,
    /// Frame id of the last successful relocalization.
    last_reloc_frame: u64,

    motion: MotionModel,
    local_map: LocalMapCache,

    /// Visual-odometry points owned by the current tick.
    temporal_points: Vec<MapPointId>,

    trajectory: TrajectoryLog,

    /// Pending monocular two-view initialization.
    mono_init: Option<MonocularInitializer>,

    /// Inliers from the last local-map refinement.
    matches_inliers: usize,

    policy: KeyframePolicy,

    map: Arc<MapStore>,

    extractor: Box<dyn FeatureExtractor>,
    init_extractor: Option<Box<dyn FeatureExtractor>>,
    matcher: Box<dyn DescriptorMatcher>,
    optimizer: Box<dyn Optimizer>,
    aligner: Box<dyn ImageAligner>,
    two_view: Box<dyn MonoInitializer>,
    mapper: Arc<dyn LocalMapping>,
    viewer: Option<Arc<dyn Viewer>>,
    events: Option<Arc<dyn TrackingEvents>>,
}

impl TrackingEngine {
    pub fn new(
        settings: &Settings,
        sensor: Sensor,
        map: Arc<MapStore>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            sensor,
            camera: settings.camera_model(),
            close_depth: settings.close_depth,
            depth_map_factor: settings.depth_map_factor,
            rgb: settings.rgb,
            state: TrackingState::NoImagesYet,
            last_processed_state: TrackingState::NoImagesYet,
            next_frame_id: 0,
            last_frame: None,
            reference_kf: None,
            last_keyframe: None,
            last_keyframe_frame: 0,
            last_reloc_frame: 0,
            motion: MotionModel::new(),
            local_map: LocalMapCache::new(),
            temporal_points: Vec::new(),
            trajectory: TrajectoryLog::new(),
            mono_init: None,
            matches_inliers: 0,
            policy: KeyframePolicy::new(settings.max_frames(), settings.min_frames()),
            map,
            extractor: collaborators.extractor,
            init_extractor: collaborators.init_extractor,
            matcher: collaborators.matcher,
            optimizer: collaborators.optimizer,
            aligner: collaborators.aligner,
            two_view: collaborators.mono_initializer,
            mapper: collaborators.local_mapper,
            viewer: collaborators.viewer,
            events: collaborators.events,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn last_processed_state(&self) -> TrackingState {
        self.last_processed_state
    }

    pub fn trajectory(&self) -> &TrajectoryLog {
        &self.trajectory
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.reference_kf
    }

    pub fn velocity(&self) -> Option<&SE3> {
        self.motion.velocity()
    }

    pub fn matches_inliers(&self) -> usize {
        self.matches_inliers
    }

    /// The most recently committed frame.
    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ingress
    // ─────────────────────────────────────────────────────────────────────

    /// Process a color/grayscale image plus its registered depth map.
    /// Returns the estimated world-to-camera pose, or None if the tick did
    /// not produce one.
    pub fn process_rgbd(
        &mut self,
        image: &DynamicImage,
        depth: &DepthMap,
        timestamp: f64,
    ) -> Option<SE3> {
        let gray = convert_grayscale(image, self.rgb);
        let features = self.extractor.extract(&gray);
        let frame = Frame::from_features(
            FrameId(self.next_frame_id),
            timestamp,
            self.camera,
            features,
            Some(depth),
            self.depth_map_factor,
            self.close_depth,
        );
        self.process_frame(frame)
    }

    /// Process a monocular image.
    pub fn process_monocular(&mut self, image: &DynamicImage, timestamp: f64) -> Option<SE3> {
        let gray = convert_grayscale(image, self.rgb);
        let bootstrapping = matches!(
            self.state,
            TrackingState::NoImagesYet | TrackingState::NotInitialized
        );
        let features = match (&self.init_extractor, bootstrapping) {
            (Some(init), true) => init.extract(&gray),
            _ => self.extractor.extract(&gray),
        };
        let frame = Frame::from_features(
            FrameId(self.next_frame_id),
            timestamp,
            self.camera,
            features,
            None,
            1.0,
            self.close_depth,
        );
        self.process_frame(frame)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Per-frame driver
    // ─────────────────────────────────────────────────────────────────────

    /// Run one tracking tick on a pre-built frame.
    ///
    /// The engine stamps the frame id; frames are processed strictly in
    /// arrival order.
    pub fn process_frame(&mut self, mut frame: Frame) -> Option<SE3> {
        frame.id = FrameId(self.next_frame_id);
        self.next_frame_id += 1;

        if self.state == TrackingState::NoImagesYet {
            self.state = TrackingState::NotInitialized;
        }
        self.last_processed_state = self.state;

        // The map is a consistent snapshot for the whole tick.
        let map_store = Arc::clone(&self.map);
        let mut map = map_store.lock();

        if self.state == TrackingState::NotInitialized {
            let ok = match self.sensor {
                Sensor::RgbD => {
                    self.stereo_initialization(&mut frame, &mut map);
                    true
                }
                Sensor::Monocular => self.monocular_initialization(&mut frame, &mut map),
            };
            if !ok {
                drop(map);
                self.notify_and_reset();
                return None;
            }
            if self.state != TrackingState::Ok {
                return frame.pose.clone();
            }
        } else if self.track(&mut frame, &mut map).is_err() {
            drop(map);
            self.notify_and_reset();
            return None;
        }

        self.record_trajectory(&frame, &map);
        let pose = frame.pose.clone();
        drop(map);
        self.last_frame = Some(frame);
        pose
    }

    /// One tracking tick after initialization. Err means a full reset is
    /// required.
    fn track(&mut self, frame: &mut Frame, map: &mut Map) -> Result<(), ()> {
        let coarse: Result<(), TrackError> = if self.state == TrackingState::Ok {
            // The back-end may have fused points tracked by the last frame.
            self.check_replaced_in_last_frame(map);

            if !self.motion.is_set() || frame.id.0 < self.last_reloc_frame + 2 {
                self.track_reference_keyframe(frame, map)
            } else {
                self.track_with_motion_model(frame, map).or_else(|err| {
                    debug!(%err, "motion model failed, trying reference keyframe");
                    self.track_reference_keyframe(frame, map)
                })
            }
        } else if self.relocalization(frame, map) {
            Ok(())
        } else {
            Err(TrackError::TrackLost)
        };

        frame.reference_kf = self.reference_kf;

        let refined = coarse.and_then(|_| self.track_local_map(frame, map));
        match refined {
            Ok(()) => self.state = TrackingState::Ok,
            Err(err) => {
                debug!(%err, "tracking failed this tick");
                self.state = TrackingState::Lost;
            }
        }

        if self.state == TrackingState::Ok {
            // Constant-velocity update from the last two poses.
            let last_pose = self.last_frame.as_ref().and_then(|f| f.pose.clone());
            if let Some(pose) = frame.pose.clone() {
                self.motion.update(&pose, last_pose.as_ref());
            }

            // Drop odometry matches that never made it into the map.
            for i in 0..frame.n() {
                let Some(mp_id) = frame.map_points[i] else {
                    continue;
                };
                let orphan = map
                    .map_point(mp_id)
                    .map(|mp| mp.num_observations() < 1)
                    .unwrap_or(true);
                if orphan {
                    frame.outlier[i] = false;
                    frame.map_points[i] = None;
                }
            }

            // This tick's temporal points are spent.
            for mp_id in std::mem::take(&mut self.temporal_points) {
                map.remove_map_point(mp_id);
            }

            let need_kf = self.policy.need_new_keyframe(&KeyframeQuery {
                frame,
                map,
                mapper: self.mapper.as_ref(),
                sensor: self.sensor,
                reference_kf: self.reference_kf,
                matches_inliers: self.matches_inliers,
                last_keyframe_frame: self.last_keyframe_frame,
                last_reloc_frame: self.last_reloc_frame,
            });
            if need_kf {
                if let Err(err) = self.create_new_keyframe(frame, map) {
                    debug!(%err, "keyframe creation skipped");
                }
            }

            // High-innovation points stay in the keyframe so bundle
            // adjustment can re-judge them, but the next frame must not
            // estimate its pose from them.
            for i in 0..frame.n() {
                if frame.map_points[i].is_some() && frame.outlier[i] {
                    frame.map_points[i] = None;
                }
            }
        }

        if self.state == TrackingState::Lost && map.keyframes_in_map() <= RESET_MAP_SIZE {
            warn!("track lost soon after initialization, resetting");
            return Err(());
        }

        if frame.reference_kf.is_none() {
            frame.reference_kf = self.reference_kf;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────

    fn stereo_initialization(&mut self, frame: &mut Frame, map: &mut Map) {
        let Some(kf_id) = stereo_initialize(frame, map) else {
            return;
        };
        self.mapper.insert_keyframe(kf_id);
        self.last_keyframe_frame = frame.id.0;
        self.last_keyframe = Some(kf_id);

        let points = map.all_map_points();
        self.local_map.seed(vec![kf_id], points.clone());
        map.set_reference_map_points(points);
        self.reference_kf = Some(kf_id);
        frame.reference_kf = Some(kf_id);
        self.state = TrackingState::Ok;
    }

    /// Returns false when initialization failed badly enough to reset.
    fn monocular_initialization(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        match self.mono_init.take() {
            None => {
                if frame.n() > MONO_MIN_KEYPOINTS {
                    self.mono_init = Some(MonocularInitializer::new(frame.clone()));
                    self.last_frame = Some(frame.clone());
                }
                true
            }
            Some(mut init) => {
                if frame.n() <= MONO_MIN_KEYPOINTS {
                    // Too few features to continue; the initializer is gone.
                    return true;
                }
                let outcome = init.attempt(
                    frame,
                    map,
                    self.matcher.as_ref(),
                    self.two_view.as_ref(),
                    self.optimizer.as_ref(),
                );
                match outcome {
                    MonoInitOutcome::Abandoned => true,
                    MonoInitOutcome::Pending => {
                        self.mono_init = Some(init);
                        true
                    }
                    MonoInitOutcome::Failed => {
                        debug!(err = %TrackError::InitializationRejected, "resetting");
                        false
                    }
                    MonoInitOutcome::Initialized {
                        initial_kf,
                        current_kf,
                    } => {
                        self.mapper.insert_keyframe(initial_kf);
                        self.mapper.insert_keyframe(current_kf);
                        self.last_keyframe_frame = frame.id.0;
                        self.last_keyframe = Some(current_kf);

                        let points = map.all_map_points();
                        self.local_map.seed(vec![current_kf, initial_kf], points.clone());
                        map.set_reference_map_points(points);
                        self.reference_kf = Some(current_kf);
                        frame.reference_kf = Some(current_kf);
                        self.state = TrackingState::Ok;
                        true
                    }
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Coarse pose estimation
    // ─────────────────────────────────────────────────────────────────────

    fn track_reference_keyframe(&self, frame: &mut Frame, map: &mut Map) -> Result<(), TrackError> {
        let last_pose = self
            .last_frame
            .as_ref()
            .and_then(|f| f.pose.clone())
            .ok_or(TrackError::TrackLost)?;
        frame.set_pose(last_pose);

        let ref_kf_id = self.reference_kf.ok_or(TrackError::TrackLost)?;
        let monocular = self.sensor == Sensor::Monocular;

        let mut n_matches = {
            let ref_kf = map.keyframe(ref_kf_id).ok_or(TrackError::TrackLost)?;
            if !self
                .aligner
                .compute_pose(frame, AlignTarget::KeyFrame(ref_kf), false)
            {
                return Err(TrackError::ImageAlignFailed);
            }
            frame.clear_map_points();
            self.matcher
                .search_by_projection_keyframe(frame, ref_kf, map, PROJECTION_RADIUS, monocular)
        };

        if n_matches < MIN_COARSE_MATCHES {
            debug!(n_matches, "few matches, widening search window");
            frame.clear_map_points();
            if let Some(last) = self.last_frame.as_ref() {
                n_matches = self.matcher.search_by_projection_frame(
                    frame,
                    last,
                    map,
                    2 * PROJECTION_RADIUS,
                    monocular,
                );
            }
        }
        if n_matches < MIN_COARSE_MATCHES {
            return Err(TrackError::InsufficientMatches {
                found: n_matches,
                needed: MIN_COARSE_MATCHES,
            });
        }

        self.optimizer.pose_optimization(frame, map);

        let map_inliers = discard_outliers(frame, map);
        if map_inliers >= MIN_MAP_INLIERS {
            Ok(())
        } else {
            Err(TrackError::PoseOptimizationRejected {
                inliers: map_inliers,
            })
        }
    }

    fn track_with_motion_model(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
    ) -> Result<(), TrackError> {
        self.update_last_frame(map);

        let last_pose = self
            .last_frame
            .as_ref()
            .and_then(|f| f.pose.clone())
            .ok_or(TrackError::TrackLost)?;
        let predicted = self.motion.predict(&last_pose).unwrap_or(last_pose);
        frame.set_pose(predicted);

        let monocular = self.sensor == Sensor::Monocular;
        let last = self.last_frame.as_ref().ok_or(TrackError::TrackLost)?;

        if !self
            .aligner
            .compute_pose(frame, AlignTarget::LastFrame(last), false)
        {
            return Err(TrackError::ImageAlignFailed);
        }

        frame.clear_map_points();
        let mut n_matches =
            self.matcher
                .search_by_projection_frame(frame, last, map, PROJECTION_RADIUS, monocular);
        if n_matches < MIN_COARSE_MATCHES {
            debug!(n_matches, "few matches, widening search window");
            frame.clear_map_points();
            n_matches = self.matcher.search_by_projection_frame(
                frame,
                last,
                map,
                2 * PROJECTION_RADIUS,
                monocular,
            );
        }
        if n_matches < MIN_COARSE_MATCHES {
            return Err(TrackError::InsufficientMatches {
                found: n_matches,
                needed: MIN_COARSE_MATCHES,
            });
        }

        self.optimizer.pose_optimization(frame, map);

        let map_inliers = discard_outliers(frame, map);
        if map_inliers >= MIN_MAP_INLIERS {
            Ok(())
        } else {
            Err(TrackError::PoseOptimizationRejected {
                inliers: map_inliers,
            })
        }
    }

    /// Re-anchor the previous frame's pose on its reference keyframe and, for
    /// depth sensors, seed temporary odometry points from its close depth
    /// readings so the projection search has dense candidates.
    fn update_last_frame(&mut self, map: &mut Map) {
        let anchor = self.trajectory.last().map(|e| e.relative_pose.clone());
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        if let (Some(tlr), Some(ref_kf)) = (anchor, last.reference_kf) {
            if let Some(kf) = map.keyframe(ref_kf) {
                last.set_pose(&tlr * &kf.pose);
            }
        }

        if self.sensor == Sensor::Monocular || self.last_keyframe_frame == last.id.0 {
            return;
        }

        let mut depth_idx: Vec<(f32, usize)> = (0..last.n())
            .filter(|&i| last.depths[i] > 0.0)
            .map(|i| (last.depths[i], i))
            .collect();
        if depth_idx.is_empty() {
            return;
        }
        depth_idx.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut n_points = 0;
        for (z, i) in depth_idx {
            let needs_new = match last.map_points[i] {
                None => true,
                Some(mp_id) => map
                    .map_point(mp_id)
                    .map(|mp| mp.num_observations() < 1)
                    .unwrap_or(true),
            };
            if needs_new {
                if let Some(position) = last.unproject_keypoint(i) {
                    let mp_id = map.create_map_point(position, last.descriptors[i], None);
                    last.map_points[i] = Some(mp_id);
                    self.temporal_points.push(mp_id);
                    n_points += 1;
                }
            } else {
                n_points += 1;
            }
            if z as f64 > last.close_depth && n_points > 100 {
                break;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local map refinement
    // ─────────────────────────────────────────────────────────────────────

    fn track_local_map(&mut self, frame: &mut Frame, map: &mut Map) -> Result<(), TrackError> {
        if let Some(reference) = self.local_map.update(frame, map) {
            self.reference_kf = Some(reference);
            frame.reference_kf = Some(reference);
        }

        self.search_local_points(frame, map);

        self.optimizer.pose_optimization(frame, map);

        self.matches_inliers = 0;
        for i in 0..frame.n() {
            let Some(mp_id) = frame.map_points[i] else {
                continue;
            };
            if frame.outlier[i] {
                continue;
            }
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.increase_found();
                if mp.num_observations() > 0 {
                    self.matches_inliers += 1;
                }
            }
        }

        // More demanding right after a relocalization.
        if frame.id.0 < self.last_reloc_frame + self.policy.max_frames && self.matches_inliers < 50
        {
            return Err(TrackError::PoseOptimizationRejected {
                inliers: self.matches_inliers,
            });
        }
        if self.matches_inliers < 30 {
            return Err(TrackError::PoseOptimizationRejected {
                inliers: self.matches_inliers,
            });
        }
        Ok(())
    }

    fn search_local_points(&mut self, frame: &mut Frame, map: &mut Map) {
        // Points already matched only get their statistics refreshed; bad
        // ones are swept out of the frame.
        for i in 0..frame.n() {
            let Some(mp_id) = frame.map_points[i] else {
                continue;
            };
            match map.map_point_mut(mp_id) {
                Some(mp) if !mp.is_bad => {
                    mp.increase_visible();
                    mp.last_frame_seen = Some(frame.id);
                    mp.track_in_view = false;
                }
                _ => frame.map_points[i] = None,
            }
        }

        let (scale_factor, n_levels) = (map.scale_factor, map.n_levels);
        let mut n_to_match = 0;
        for &mp_id in &self.local_map.points {
            let Some(mp) = map.map_point_mut(mp_id) else {
                continue;
            };
            if mp.last_frame_seen == Some(frame.id) || mp.is_bad {
                continue;
            }
            if frame.is_in_frustum(mp, 0.5, scale_factor, n_levels) {
                mp.increase_visible();
                n_to_match += 1;
            }
        }

        if n_to_match > 0 {
            let mut radius = match self.sensor {
                Sensor::Monocular => 1,
                Sensor::RgbD => 3,
            };
            if frame.id.0 < self.last_reloc_frame + 2 {
                radius = 5;
            }
            self.matcher
                .search_by_projection_points(frame, &self.local_map.points, map, radius);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Relocalization
    // ─────────────────────────────────────────────────────────────────────

    /// Linear scan over all keyframes, newest first. Deployments with place
    /// recognition would shortlist candidates instead.
    fn relocalization(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        let monocular = self.sensor == Sensor::Monocular;
        let candidates = map.all_keyframes();

        for kf_id in candidates.into_iter().rev() {
            let n_matches = {
                let Some(kf) = map.keyframe(kf_id) else {
                    continue;
                };
                if kf.is_bad {
                    continue;
                }
                frame.set_pose(kf.pose.clone());

                if !self
                    .aligner
                    .compute_pose(frame, AlignTarget::KeyFrame(kf), true)
                {
                    continue;
                }

                frame.clear_map_points();
                self.matcher
                    .search_by_projection_keyframe(frame, kf, map, PROJECTION_RADIUS, monocular)
            };
            if n_matches < MIN_COARSE_MATCHES {
                continue;
            }

            let n_good = self.optimizer.pose_optimization(frame, map);
            if n_good < MIN_MAP_INLIERS {
                continue;
            }

            self.last_reloc_frame = frame.id.0;
            info!(keyframe = %kf_id, "relocalized");
            return true;
        }

        false
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keyframe creation
    // ─────────────────────────────────────────────────────────────────────

    fn create_new_keyframe(&mut self, frame: &mut Frame, map: &mut Map) -> Result<(), TrackError> {
        // Guard against a concurrent back-end stop; losing the race skips
        // this keyframe.
        if !self.mapper.set_not_stop(true) {
            return Err(TrackError::BackendBusy);
        }

        let Some(kf_id) = map.promote_frame(frame) else {
            self.mapper.set_not_stop(false);
            return Ok(());
        };
        map.register_observations(kf_id);
        self.reference_kf = Some(kf_id);
        frame.reference_kf = Some(kf_id);

        if self.sensor != Sensor::Monocular {
            self.create_close_points(frame, map, kf_id);
        }

        map.update_connections(kf_id);
        self.mapper.insert_keyframe(kf_id);
        self.mapper.set_not_stop(false);

        self.last_keyframe_frame = frame.id.0;
        self.last_keyframe = Some(kf_id);
        info!(keyframe = %kf_id, frame = %frame.id, "new keyframe");
        Ok(())
    }

    /// Create map points for close depth readings, nearest first. Beyond the
    /// close threshold only the 100 nearest points are kept.
    fn create_close_points(&self, frame: &mut Frame, map: &mut Map, kf_id: KeyFrameId) {
        let mut depth_idx: Vec<(f32, usize)> = (0..frame.n())
            .filter(|&i| frame.depths[i] > 0.0)
            .map(|i| (frame.depths[i], i))
            .collect();
        if depth_idx.is_empty() {
            return;
        }
        depth_idx.sort_by(|a, b| a.0.total_cmp(&b.0));

        let center = map
            .keyframe(kf_id)
            .map(|kf| kf.camera_center())
            .unwrap_or_default();
        let (scale_factor, n_levels) = (map.scale_factor, map.n_levels);

        let mut n_points = 0;
        for (z, i) in depth_idx {
            let needs_new = match frame.map_points[i] {
                None => true,
                Some(mp_id) => {
                    let orphan = map
                        .map_point(mp_id)
                        .map(|mp| mp.num_observations() < 1)
                        .unwrap_or(true);
                    if orphan {
                        frame.map_points[i] = None;
                    }
                    orphan
                }
            };

            if needs_new {
                if let Some(position) = frame.unproject_keypoint(i) {
                    let mp_id = map.create_map_point(position, frame.descriptors[i], Some(kf_id));
                    map.associate(kf_id, i, mp_id);
                    if let Some(mp) = map.map_point_mut(mp_id) {
                        mp.update_normal_and_depth(std::iter::once(&center), scale_factor, n_levels);
                    }
                    frame.map_points[i] = Some(mp_id);
                    n_points += 1;
                }
            } else {
                n_points += 1;
            }

            if z as f64 > frame.close_depth && n_points > 100 {
                break;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bookkeeping
    // ─────────────────────────────────────────────────────────────────────

    /// Rewrite last-frame associations through the replaced-by forwarders.
    fn check_replaced_in_last_frame(&mut self, map: &Map) {
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        for slot in last.map_points.iter_mut() {
            let Some(mp_id) = *slot else {
                continue;
            };
            match map.resolve_replacement(mp_id) {
                None => *slot = None,
                Some(current) if current != mp_id => *slot = Some(current),
                _ => {}
            }
        }
    }

    fn record_trajectory(&mut self, frame: &Frame, map: &Map) {
        let lost = self.state == TrackingState::Lost;
        if let (Some(pose), Some(ref_kf)) = (&frame.pose, frame.reference_kf) {
            if let Some(kf) = map.keyframe(ref_kf) {
                let tcr = pose * &kf.pose_inverse();
                self.trajectory.push(tcr, ref_kf, frame.timestamp, lost);
                return;
            }
        }
        // Lost before a pose was produced: repeat the previous entry.
        self.trajectory.repeat_last(lost);
    }

    fn notify_and_reset(&mut self) {
        if let Some(events) = &self.events {
            events.reset_requested();
        }
        self.reset();
    }

    /// Full system reset: stop the viewer, reset the back-end, clear the map
    /// and all engine state, restart id numbering.
    pub fn reset(&mut self) {
        info!("system resetting");
        if let Some(viewer) = &self.viewer {
            viewer.request_stop();
            while !viewer.is_stopped() {
                std::thread::sleep(VIEWER_STOP_POLL);
            }
        }

        self.mapper.request_reset();
        self.map.lock().clear();

        self.state = TrackingState::NoImagesYet;
        self.last_processed_state = TrackingState::NoImagesYet;
        self.next_frame_id = 0;
        self.last_frame = None;
        self.reference_kf = None;
        self.last_keyframe = None;
        self.last_keyframe_frame = 0;
        self.last_reloc_frame = 0;
        self.motion.clear();
        self.local_map.clear();
        self.temporal_points.clear();
        self.trajectory.clear();
        self.mono_init = None;
        self.matches_inliers = 0;

        if let Some(viewer) = &self.viewer {
            viewer.release();
        }
    }
}

/// Sweep pose-optimization outliers out of the frame and count the inliers
/// that are backed by map observations.
fn discard_outliers(frame: &mut Frame, map: &mut Map) -> usize {
    let mut map_inliers = 0;
    for i in 0..frame.n() {
        let Some(mp_id) = frame.map_points[i] else {
            continue;
        };
        if frame.outlier[i] {
            frame.map_points[i] = None;
            frame.outlier[i] = false;
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.track_in_view = false;
                mp.last_frame_seen = Some(frame.id);
            }
        } else if map
            .map_point(mp_id)
            .map(|mp| mp.num_observations() > 0)
            .unwrap_or(false)
        {
            map_inliers += 1;
        }
    }
    map_inliers
}
