//! Collaborator seams and inter-thread plumbing around the tracker.

pub mod collaborators;
pub mod local_mapper;

pub use collaborators::{
    AlignTarget, DescriptorMatcher, FeatureExtractor, ImageAligner, MonoInitializer, Optimizer,
    TrackingEvents, TwoViewGeometry, Viewer,
};
pub use local_mapper::{LocalMapperLink, LocalMapping};
