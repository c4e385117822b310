//! Frame - a single captured image with extracted features and pose estimate.
//!
//! A frame is built once per tick and owns nothing from the map: its
//! map-point slots are handles that may go stale between ticks and are healed
//! or swept by the tracker.

use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use nalgebra::Vector3;
use tracing::trace;

use crate::camera::CameraModel;
use crate::features::{Descriptor, FeatureSet, KeyPoint};
use crate::geometry::SE3;
use crate::map::{FrameId, KeyFrameId, MapPoint, MapPointId};

/// Depth image in 32-bit float meters.
pub type DepthMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// A single captured image with features and tracking state.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub timestamp: f64,
    pub camera: CameraModel,

    /// Raw detections and their undistorted counterparts.
    pub keypoints: Vec<KeyPoint>,
    pub keypoints_un: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,

    /// Per-keypoint depth in meters; negative when unknown (monocular).
    pub depths: Vec<f32>,

    /// Close/far point threshold in meters.
    pub close_depth: f64,

    /// World-to-camera pose (Tcw); None until estimated.
    pub pose: Option<SE3>,

    /// Keypoint index → map point association.
    pub map_points: Vec<Option<MapPointId>>,

    /// Per-keypoint outlier flag written by pose optimization.
    pub outlier: Vec<bool>,

    /// Reference keyframe used for relative-pose bookkeeping.
    pub reference_kf: Option<KeyFrameId>,
}

impl Frame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: FrameId,
        timestamp: f64,
        camera: CameraModel,
        keypoints: Vec<KeyPoint>,
        keypoints_un: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        depths: Vec<f32>,
        close_depth: f64,
    ) -> Self {
        let n = keypoints.len();
        Self {
            id,
            timestamp,
            camera,
            keypoints,
            keypoints_un,
            descriptors,
            depths,
            close_depth,
            pose: None,
            map_points: vec![None; n],
            outlier: vec![false; n],
            reference_kf: None,
        }
    }

    /// Build a frame from extractor output, undistorting keypoints and
    /// sampling the depth map (when present) at the raw detections.
    #[allow(clippy::too_many_arguments)]
    pub fn from_features(
        id: FrameId,
        timestamp: f64,
        camera: CameraModel,
        features: FeatureSet,
        depth: Option<&DepthMap>,
        depth_factor: f64,
        close_depth: f64,
    ) -> Self {
        let keypoints_un: Vec<KeyPoint> = features
            .keypoints
            .iter()
            .map(|kp| {
                let (u, v) = camera.undistort_point(kp.pt.x as f64, kp.pt.y as f64);
                let mut un = *kp;
                un.pt.x = u as f32;
                un.pt.y = v as f32;
                un
            })
            .collect();

        let depths: Vec<f32> = match depth {
            Some(map) => features
                .keypoints
                .iter()
                .map(|kp| {
                    let x = kp.pt.x.round() as i64;
                    let y = kp.pt.y.round() as i64;
                    if x < 0 || y < 0 || x >= map.width() as i64 || y >= map.height() as i64 {
                        return -1.0;
                    }
                    let raw = map.get_pixel(x as u32, y as u32)[0];
                    if raw > 0.0 {
                        raw * depth_factor as f32
                    } else {
                        -1.0
                    }
                })
                .collect(),
            None => vec![-1.0; features.keypoints.len()],
        };

        trace!(frame = %id, keypoints = features.keypoints.len(), "built frame");

        Self::new(
            id,
            timestamp,
            camera,
            features.keypoints,
            keypoints_un,
            features.descriptors,
            depths,
            close_depth,
        )
    }

    pub fn n(&self) -> usize {
        self.keypoints.len()
    }

    pub fn set_pose(&mut self, pose: SE3) {
        self.pose = Some(pose);
    }

    /// Camera center in world coordinates, if a pose is set.
    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose.as_ref().map(SE3::camera_center)
    }

    /// Clear every map-point association.
    pub fn clear_map_points(&mut self) {
        self.map_points.iter_mut().for_each(|slot| *slot = None);
    }

    /// Unproject keypoint `i` into world coordinates using its depth.
    pub fn unproject_keypoint(&self, i: usize) -> Option<Vector3<f64>> {
        let z = *self.depths.get(i)? as f64;
        if z <= 0.0 {
            return None;
        }
        let pose = self.pose.as_ref()?;
        let kp = &self.keypoints_un[i];
        let p_cam = self
            .camera
            .unproject(kp.pt.x as f64, kp.pt.y as f64, z);
        Some(pose.inverse().transform_point(&p_cam))
    }

    /// Frustum visibility test for local-map points.
    ///
    /// On success fills the point's projection cache (`track_proj_*`,
    /// `track_scale_level`, `track_view_cos`) and raises `track_in_view`.
    pub fn is_in_frustum(
        &self,
        mp: &mut MapPoint,
        viewing_cos_limit: f64,
        scale_factor: f64,
        n_levels: u32,
    ) -> bool {
        mp.track_in_view = false;

        let Some(pose) = self.pose.as_ref() else {
            return false;
        };

        let p_cam = pose.transform_point(&mp.position);
        if p_cam.z <= 0.0 {
            return false;
        }

        let Some((u, v)) = self.camera.project(&p_cam) else {
            return false;
        };
        if !self.camera.in_image(u, v) {
            return false;
        }

        let po = mp.position - pose.camera_center();
        let dist = po.norm();
        if !mp.is_in_distance_range(dist) {
            return false;
        }

        let view_cos = po.dot(&mp.normal) / dist;
        if view_cos < viewing_cos_limit {
            return false;
        }

        mp.track_proj_x = u;
        mp.track_proj_y = v;
        mp.track_scale_level = mp.predict_scale(dist, scale_factor, n_levels);
        mp.track_view_cos = view_cos;
        mp.track_in_view = true;
        true
    }

    /// Indices of undistorted keypoints within `radius` of (u, v), optionally
    /// restricted to a pyramid level range.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.keypoints_un
            .iter()
            .enumerate()
            .filter(|(_, kp)| {
                if min_level.is_some_and(|min| kp.octave < min) {
                    return false;
                }
                if max_level.is_some_and(|max| kp.octave > max) {
                    return false;
                }
                let du = kp.pt.x as f64 - u;
                let dv = kp.pt.y as f64 - v;
                du * du + dv * dv <= radius_sq
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// Convert an incoming image to grayscale honoring the configured channel
/// order (true = RGB, false = BGR).
pub fn convert_grayscale(image: &DynamicImage, rgb: bool) -> GrayImage {
    if rgb {
        return image.to_luma8();
    }
    // BGR input: swap the channels before the luma weighting.
    let rgb_img = image.to_rgb8();
    let mut out = GrayImage::new(rgb_img.width(), rgb_img.height());
    for (src, dst) in rgb_img.pixels().zip(out.pixels_mut()) {
        let [b, g, r] = src.0;
        let luma =
            0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        dst.0 = [luma.round().clamp(0.0, 255.0) as u8];
    }
    out
}

/// Convert a raw 16-bit depth image (e.g. Kinect millimeters) to float
/// meters using the configured depth map factor.
pub fn depth_to_meters(raw: &ImageBuffer<Luma<u16>, Vec<u16>>, depth_factor: f64) -> DepthMap {
    let mut out = DepthMap::new(raw.width(), raw.height());
    for (src, dst) in raw.pixels().zip(out.pixels_mut()) {
        dst.0 = [src.0[0] as f32 * depth_factor as f32];
    }
    out
}
