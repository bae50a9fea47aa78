//! The keyframe map and its data model.

pub mod keyframe;
pub mod landmark;
pub mod map;
pub mod types;

pub use keyframe::{
    Descriptor, ImuSummary, Keyframe, Keypoint, LoopConstraint, NavsatFix, ScanFeatures,
    VisualFeatures,
};
pub use landmark::{Landmark, LandmarkStore};
pub use map::{KeyframeMap, MapError};
pub use types::{KeyframeId, LandmarkId, Timestamp};
