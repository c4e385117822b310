//! Settings loading from ORB-style YAML calibration files.
//!
//! The settings file is a flat keyed dictionary (`Camera.fx`, `ORBextractor.
//! nFeatures`, ...). Files written for OpenCV's `FileStorage` start with a
//! `%YAML:1.0` directive that standard YAML parsers reject, so the loader
//! strips it before parsing.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::camera::CameraModel;

/// Sensor modality the tracker is driven with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Monocular,
    RgbD,
}

/// Parsed calibration and tracking parameters.
#[derive(Debug, Clone)]
pub struct Settings {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub bf: f64,
    pub fps: f64,
    /// Color channel order of incoming images: true for RGB, false for BGR.
    pub rgb: bool,
    pub width: u32,
    pub height: u32,

    pub n_features: usize,
    pub scale_factor: f64,
    pub n_levels: u32,
    pub ini_th_fast: i32,
    pub min_th_fast: i32,

    /// Close/far point threshold in meters (RGB-D): `bf * ThDepth / fx`.
    pub close_depth: f64,
    /// Multiplier converting raw depth values to meters.
    pub depth_map_factor: f64,
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading settings file {}", path.as_ref().display()))?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let text: String = text
            .lines()
            .filter(|l| !l.trim_start().starts_with("%YAML"))
            .collect::<Vec<_>>()
            .join("\n");

        let raw: HashMap<String, serde_yaml::Value> =
            serde_yaml::from_str(&text).context("parsing settings YAML")?;
        let dict = Dict(&raw);

        let fx = dict.require("Camera.fx")?;
        let fy = dict.require("Camera.fy")?;
        let cx = dict.require("Camera.cx")?;
        let cy = dict.require("Camera.cy")?;

        let mut fps = dict.get("Camera.fps").unwrap_or(30.0);
        if fps == 0.0 {
            fps = 30.0;
        }

        let bf = dict.get("Camera.bf").unwrap_or(0.0);
        let th_depth = dict.get("ThDepth").unwrap_or(0.0);

        let raw_factor = dict.get("DepthMapFactor").unwrap_or(1.0);
        let depth_map_factor = if raw_factor.abs() < 1e-5 {
            1.0
        } else {
            1.0 / raw_factor
        };

        let settings = Self {
            fx,
            fy,
            cx,
            cy,
            k1: dict.get("Camera.k1").unwrap_or(0.0),
            k2: dict.get("Camera.k2").unwrap_or(0.0),
            p1: dict.get("Camera.p1").unwrap_or(0.0),
            p2: dict.get("Camera.p2").unwrap_or(0.0),
            k3: dict.get("Camera.k3").unwrap_or(0.0),
            bf,
            fps,
            rgb: dict.get("Camera.RGB").unwrap_or(1.0) != 0.0,
            width: dict.get("Camera.width").unwrap_or(640.0) as u32,
            height: dict.get("Camera.height").unwrap_or(480.0) as u32,
            n_features: dict.get("ORBextractor.nFeatures").unwrap_or(1000.0) as usize,
            scale_factor: dict.get("ORBextractor.scaleFactor").unwrap_or(1.2),
            n_levels: dict.get("ORBextractor.nLevels").unwrap_or(8.0) as u32,
            ini_th_fast: dict.get("ORBextractor.iniThFAST").unwrap_or(20.0) as i32,
            min_th_fast: dict.get("ORBextractor.minThFAST").unwrap_or(7.0) as i32,
            close_depth: bf * th_depth / fx,
            depth_map_factor,
        };

        info!(
            fx = settings.fx,
            fy = settings.fy,
            fps = settings.fps,
            n_features = settings.n_features,
            close_depth = settings.close_depth,
            "loaded camera settings"
        );

        Ok(settings)
    }

    pub fn camera_model(&self) -> CameraModel {
        CameraModel::new(self.fx, self.fy, self.cx, self.cy, self.width, self.height)
            .with_distortion(self.k1, self.k2, self.p1, self.p2, self.k3)
            .with_baseline(self.bf)
    }

    /// Keyframe insertion window upper bound: one second worth of frames.
    pub fn max_frames(&self) -> u64 {
        self.fps as u64
    }

    /// Keyframe insertion window lower bound.
    pub fn min_frames(&self) -> u64 {
        0
    }
}

struct Dict<'a>(&'a HashMap<String, serde_yaml::Value>);

impl Dict<'_> {
    fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(|v| v.as_f64())
    }

    fn require(&self, key: &str) -> Result<f64> {
        self.get(key)
            .ok_or_else(|| anyhow!("missing settings key {key}"))
    }
}
