//! World-frame point map assembled from refined keyframes.

use std::collections::BTreeMap;

use image::GrayImage;
use nalgebra::Vector3;

use crate::cloud::{voxel_downsample_colored, ColoredPoint};
use crate::geometry::{CameraModel, SE3};
use crate::map::{ScanFeatures, Timestamp};

/// Intensity assigned to points the camera cannot paint.
const DEFAULT_INTENSITY: u8 = 128;

/// Render one keyframe's scan into world-frame colored points.
///
/// Points behind the sensor plane (`z <= 0` in the body frame) are dropped.
/// When an image and camera model are available, each remaining point is
/// painted with the grayscale value it projects onto; out-of-view points
/// keep the default intensity.
pub fn render_scan(
    pose: &SE3,
    scan: &ScanFeatures,
    image: Option<&GrayImage>,
    camera: Option<&CameraModel>,
) -> Vec<ColoredPoint> {
    let body_to_world = pose.inverse();
    let cloud = scan.merged();
    let mut rendered = Vec::with_capacity(cloud.len());
    for point in &cloud.points {
        if point.z <= 0.0 {
            continue;
        }
        rendered.push(ColoredPoint {
            position: body_to_world.transform_point(point),
            intensity: sample_intensity(point, image, camera),
        });
    }
    rendered
}

fn sample_intensity(
    point: &Vector3<f64>,
    image: Option<&GrayImage>,
    camera: Option<&CameraModel>,
) -> u8 {
    let (Some(image), Some(camera)) = (image, camera) else {
        return DEFAULT_INTENSITY;
    };
    let Some(pixel) = camera.project(point) else {
        return DEFAULT_INTENSITY;
    };
    let (u, v) = (pixel.x.round(), pixel.y.round());
    if u < 0.0 || v < 0.0 || u >= f64::from(image.width()) || v >= f64::from(image.height()) {
        return DEFAULT_INTENSITY;
    }
    image.get_pixel(u as u32, v as u32).0[0]
}

/// Colored world points bucketed per keyframe, so re-refining a span replaces
/// exactly that span's contribution.
#[derive(Debug, Default)]
pub struct WorldMap {
    buckets: BTreeMap<Timestamp, Vec<ColoredPoint>>,
}

impl WorldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the bucket rendered from the keyframe at `time`.
    pub fn insert_bucket(&mut self, time: Timestamp, points: Vec<ColoredPoint>) {
        self.buckets.insert(time, points);
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_points(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Concatenate every bucket and downsample onto a `leaf`-sized grid.
    pub fn global_cloud(&self, leaf: f64) -> Vec<ColoredPoint> {
        let merged: Vec<ColoredPoint> = self.buckets.values().flatten().copied().collect();
        voxel_downsample_colored(&merged, leaf)
    }
}
