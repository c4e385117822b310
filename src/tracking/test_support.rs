//! Shared fixtures for tracking tests: synthetic frames and scriptable
//! collaborator doubles.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use image::GrayImage;
use nalgebra::Point2;
use parking_lot::Mutex;

use crate::camera::CameraModel;
use crate::config::Settings;
use crate::features::{FeatureSet, KeyPoint};
use crate::map::{FrameId, KeyFrame, Map, MapPointId};
use crate::system::{
    AlignTarget, DescriptorMatcher, FeatureExtractor, ImageAligner, MonoInitializer, Optimizer,
    TrackingEvents, TwoViewGeometry, Viewer,
};
use crate::tracking::frame::Frame;

pub fn test_camera() -> CameraModel {
    CameraModel::new(500.0, 500.0, 320.0, 240.0, 640, 480).with_baseline(40.0)
}

pub fn test_settings() -> Settings {
    Settings {
        fx: 500.0,
        fy: 500.0,
        cx: 320.0,
        cy: 240.0,
        k1: 0.0,
        k2: 0.0,
        p1: 0.0,
        p2: 0.0,
        k3: 0.0,
        bf: 40.0,
        fps: 30.0,
        rgb: true,
        width: 640,
        height: 480,
        n_features: 1000,
        scale_factor: 1.2,
        n_levels: 8,
        ini_th_fast: 20,
        min_th_fast: 7,
        close_depth: 3.0,
        depth_map_factor: 1.0,
    }
}

/// Keypoints on a regular grid inside the image.
pub fn grid_keypoints(n: usize) -> Vec<KeyPoint> {
    (0..n)
        .map(|i| {
            KeyPoint::new(
                20.0 + (i % 30) as f32 * 20.0,
                15.0 + (i / 30) as f32 * 22.0,
                0,
            )
        })
        .collect()
}

/// RGB-D frame: the first `n_depth` keypoints carry a 2 m depth reading.
pub fn rgbd_frame(id: u64, n: usize, n_depth: usize, camera: CameraModel) -> Frame {
    let kps = grid_keypoints(n);
    let depths = (0..n).map(|i| if i < n_depth { 2.0 } else { -1.0 }).collect();
    Frame::new(
        FrameId(id),
        id as f64 / 30.0,
        camera,
        kps.clone(),
        kps,
        vec![[0u8; 32]; n],
        depths,
        3.0,
    )
}

/// Monocular frame with `n` keypoints and no depth.
pub fn mono_frame(id: u64, n: usize, camera: CameraModel) -> Frame {
    let kps = grid_keypoints(n);
    Frame::new(
        FrameId(id),
        id as f64 / 30.0,
        camera,
        kps.clone(),
        kps,
        vec![[0u8; 32]; n],
        vec![-1.0; n],
        0.0,
    )
}

/// Extractor emitting a fixed keypoint grid.
pub struct GridExtractor {
    pub n: usize,
}

impl FeatureExtractor for GridExtractor {
    fn extract(&self, _image: &GrayImage) -> FeatureSet {
        FeatureSet {
            keypoints: grid_keypoints(self.n),
            descriptors: vec![[0u8; 32]; self.n],
        }
    }
}

/// Matcher that copies associations from the reference slots, index-aligned.
///
/// `script_caps` limits the match count of upcoming keyframe/frame projection
/// searches, one entry per call; an empty script means unlimited.
#[derive(Clone, Default)]
pub struct MockMatcher {
    caps: Arc<Mutex<VecDeque<usize>>>,
    init_cap: Arc<Mutex<Option<usize>>>,
}

impl MockMatcher {
    pub fn script_caps(&self, caps: &[usize]) {
        self.caps.lock().extend(caps.iter().copied());
    }

    pub fn script_init_matches(&self, cap: usize) {
        *self.init_cap.lock() = Some(cap);
    }

    fn next_cap(&self) -> usize {
        self.caps.lock().pop_front().unwrap_or(usize::MAX)
    }

    fn associate_from_slots(
        frame: &mut Frame,
        slots: &[Option<MapPointId>],
        map: &Map,
        cap: usize,
    ) -> usize {
        let mut n = 0;
        for i in 0..frame.n().min(slots.len()) {
            if n >= cap {
                break;
            }
            let Some(mp_id) = slots[i] else {
                continue;
            };
            if map.map_point(mp_id).map(|mp| mp.is_bad).unwrap_or(true) {
                continue;
            }
            frame.map_points[i] = Some(mp_id);
            frame.outlier[i] = false;
            n += 1;
        }
        n
    }
}

impl DescriptorMatcher for MockMatcher {
    fn search_by_projection_keyframe(
        &self,
        frame: &mut Frame,
        reference: &KeyFrame,
        map: &Map,
        _radius: u32,
        _monocular: bool,
    ) -> usize {
        Self::associate_from_slots(frame, &reference.map_points, map, self.next_cap())
    }

    fn search_by_projection_frame(
        &self,
        frame: &mut Frame,
        last: &Frame,
        map: &Map,
        _radius: u32,
        _monocular: bool,
    ) -> usize {
        Self::associate_from_slots(frame, &last.map_points, map, self.next_cap())
    }

    fn search_by_projection_points(
        &self,
        frame: &mut Frame,
        candidates: &[MapPointId],
        map: &Map,
        _radius: u32,
    ) -> usize {
        let existing: HashSet<MapPointId> = frame.map_points.iter().flatten().copied().collect();
        let mut empty_slots = (0..frame.n())
            .filter(|&i| frame.map_points[i].is_none())
            .collect::<Vec<_>>()
            .into_iter();
        let mut n = 0;
        for &mp_id in candidates {
            if existing.contains(&mp_id) {
                continue;
            }
            // Only points the frustum pass marked as candidates.
            match map.live_map_point(mp_id) {
                Some(mp) if mp.track_in_view => {}
                _ => continue,
            }
            let Some(slot) = empty_slots.next() else {
                break;
            };
            frame.map_points[slot] = Some(mp_id);
            frame.outlier[slot] = false;
            n += 1;
        }
        n
    }

    fn search_for_initialization(
        &self,
        reference: &Frame,
        current: &Frame,
        prev_matched: &mut [Point2<f32>],
        matches: &mut [i32],
        _window: u32,
    ) -> usize {
        let cap = (*self.init_cap.lock()).unwrap_or(usize::MAX);
        let n = reference.n().min(current.n()).min(cap);
        for (i, m) in matches.iter_mut().enumerate() {
            *m = if i < n { i as i32 } else { -1 };
        }
        for i in 0..n.min(prev_matched.len()) {
            prev_matched[i] = current.keypoints_un[i].pt;
        }
        n
    }
}

/// Optimizer double: counts associated non-outlier slots as inliers and can
/// flag a scripted set of slots as outliers on its next invocation.
#[derive(Clone, Default)]
pub struct MockOptimizer {
    outliers_once: Arc<Mutex<Vec<usize>>>,
}

impl MockOptimizer {
    pub fn script_outliers_once(&self, slots: &[usize]) {
        *self.outliers_once.lock() = slots.to_vec();
    }
}

impl Optimizer for MockOptimizer {
    fn pose_optimization(&self, frame: &mut Frame, _map: &Map) -> usize {
        for slot in self.outliers_once.lock().drain(..) {
            if slot < frame.n() && frame.map_points[slot].is_some() {
                frame.outlier[slot] = true;
            }
        }
        (0..frame.n())
            .filter(|&i| frame.map_points[i].is_some() && !frame.outlier[i])
            .count()
    }

    fn global_bundle_adjustment(&self, _map: &mut Map, _iterations: usize) {}
}

/// Aligner double with a scripted result queue; empty means success.
#[derive(Clone, Default)]
pub struct MockAligner {
    results: Arc<Mutex<VecDeque<bool>>>,
}

impl MockAligner {
    pub fn script_results(&self, results: &[bool]) {
        self.results.lock().extend(results.iter().copied());
    }
}

impl ImageAligner for MockAligner {
    fn compute_pose(&self, _frame: &mut Frame, _target: AlignTarget<'_>, _reloc: bool) -> bool {
        self.results.lock().pop_front().unwrap_or(true)
    }
}

/// Two-view reconstruction double returning a preloaded geometry.
#[derive(Clone, Default)]
pub struct MockTwoView {
    geometry: Arc<Mutex<Option<TwoViewGeometry>>>,
}

impl MockTwoView {
    pub fn set_geometry(&self, geometry: TwoViewGeometry) {
        *self.geometry.lock() = Some(geometry);
    }
}

impl MonoInitializer for MockTwoView {
    fn initialize(
        &self,
        _reference: &Frame,
        _current: &Frame,
        _matches: &[i32],
    ) -> Option<TwoViewGeometry> {
        self.geometry.lock().clone()
    }
}

/// Records reset requests from the engine.
#[derive(Default)]
pub struct MockEvents {
    resets: AtomicUsize,
}

impl MockEvents {
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl TrackingEvents for MockEvents {
    fn reset_requested(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Viewer that stops immediately when asked.
#[derive(Default)]
pub struct MockViewer {
    stopped: AtomicBool,
    released: AtomicUsize,
}

impl MockViewer {
    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl Viewer for MockViewer {
    fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
