use std::fmt;
use std::sync::Arc;

use image::GrayImage;
use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::cloud::PointCloud;
use crate::geometry::SE3;
use crate::map::types::{KeyframeId, LandmarkId, Timestamp};

/// 256-bit binary appearance descriptor, packed into 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    /// Hamming distance to another descriptor (0..=256).
    pub fn hamming_distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// A detected image keypoint, optionally tied to a landmark and carrying an
/// appearance descriptor once one has been computed.
#[derive(Debug, Clone)]
pub struct Keypoint {
    pub pixel: Vector2<f64>,
    pub landmark: Option<LandmarkId>,
    pub descriptor: Option<Descriptor>,
}

impl Keypoint {
    pub fn new(pixel: Vector2<f64>) -> Self {
        Self {
            pixel,
            landmark: None,
            descriptor: None,
        }
    }
}

/// Visual payload: keypoints plus the grayscale frame they came from.
/// The image is shared, not copied, when keyframes are cloned.
#[derive(Clone, Default)]
pub struct VisualFeatures {
    pub image: Option<Arc<GrayImage>>,
    pub keypoints: Vec<Keypoint>,
}

impl fmt::Debug for VisualFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisualFeatures")
            .field("keypoints", &self.keypoints.len())
            .field("has_image", &self.image.is_some())
            .finish()
    }
}

/// Lidar payload: the edge ("sharp") and planar ("flat") feature subsets of
/// one scan, in the body frame. Immutable after creation and shared between
/// clones.
#[derive(Clone)]
pub struct ScanFeatures {
    pub sharp: Arc<PointCloud>,
    pub flat: Arc<PointCloud>,
}

impl ScanFeatures {
    pub fn new(sharp: PointCloud, flat: PointCloud) -> Self {
        Self {
            sharp: Arc::new(sharp),
            flat: Arc::new(flat),
        }
    }

    /// Both subsets concatenated into one body-frame cloud.
    pub fn merged(&self) -> PointCloud {
        let mut cloud = PointCloud::new();
        cloud.extend_from(&self.sharp);
        cloud.extend_from(&self.flat);
        cloud
    }

    pub fn len(&self) -> usize {
        self.sharp.len() + self.flat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sharp.is_empty() && self.flat.is_empty()
    }
}

impl fmt::Debug for ScanFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanFeatures")
            .field("sharp", &self.sharp.len())
            .field("flat", &self.flat.len())
            .finish()
    }
}

/// Pre-integrated inertial increments over the interval ending at this
/// keyframe.
#[derive(Debug, Clone, Copy)]
pub struct ImuSummary {
    pub dt: f64,
    pub delta_rotation: UnitQuaternion<f64>,
    pub delta_velocity: Vector3<f64>,
    pub delta_position: Vector3<f64>,
}

/// Satellite position fix, already mapped into world coordinates.
#[derive(Debug, Clone, Copy)]
pub struct NavsatFix {
    pub position: Vector3<f64>,
}

/// A verified loop-closure constraint attached to a keyframe. The relative
/// pose satisfies `pose_current ≈ relative_pose ∘ pose_matched`. Presence
/// pins this keyframe (and the matched one) fixed in subsequent solves.
#[derive(Debug, Clone, Copy)]
pub struct LoopConstraint {
    pub matched_time: Timestamp,
    pub relative_pose: SE3,
    pub score: f64,
}

/// A keyframe: one timestamped pose plus whatever sensor payloads the front
/// end attached. The id and time never change after insertion; the pose is
/// rewritten only under the map's write lock.
#[derive(Clone)]
pub struct Keyframe {
    // identity
    pub id: KeyframeId,
    pub time: Timestamp,

    // state
    /// World→body transform.
    pub pose: SE3,

    // per-modality payloads
    pub visual: Option<VisualFeatures>,
    pub scan: Option<ScanFeatures>,
    pub inertial: Option<ImuSummary>,
    pub navsat: Option<NavsatFix>,
    pub loop_constraint: Option<LoopConstraint>,
}

impl Keyframe {
    /// A bare keyframe with no payloads. The id is assigned by the map at
    /// insertion; the value passed here is a placeholder.
    pub fn new(time: Timestamp, pose: SE3) -> Self {
        Self {
            id: KeyframeId::new(0),
            time,
            pose,
            visual: None,
            scan: None,
            inertial: None,
            navsat: None,
            loop_constraint: None,
        }
    }

    /// Body origin in world coordinates.
    pub fn position(&self) -> Vector3<f64> {
        self.pose.inverse().translation
    }

    pub fn has_scan(&self) -> bool {
        self.scan.as_ref().map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn has_image(&self) -> bool {
        self.visual
            .as_ref()
            .map(|v| v.image.is_some())
            .unwrap_or(false)
    }
}

impl fmt::Debug for Keyframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyframe")
            .field("id", &self.id)
            .field("time", &self.time)
            .field("pose", &self.pose)
            .field("visual", &self.visual)
            .field("scan", &self.scan)
            .field("loop", &self.loop_constraint.is_some())
            .finish()
    }
}
