//! The shared landmark map: keyframes, map points and their graphs.

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::{Map, MapStore};
pub use map_point::MapPoint;
pub use types::{FrameId, KeyFrameId, MapPointId};
