//! Point cloud containers and filtering.

pub mod registration;

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::geometry::SE3;

pub use registration::{icp_align, IcpConfig, IcpResult};

/// A bare 3D point cloud in some body or world frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Vector3<f64>>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    pub fn from_points(points: Vec<Vector3<f64>>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, point: Vector3<f64>) {
        self.points.push(point);
    }

    pub fn extend_from(&mut self, other: &PointCloud) {
        self.points.extend_from_slice(&other.points);
    }

    /// The cloud with `transform` applied to every point.
    pub fn transformed(&self, transform: &SE3) -> PointCloud {
        PointCloud {
            points: self
                .points
                .iter()
                .map(|p| transform.transform_point(p))
                .collect(),
        }
    }
}

/// A world-frame point carrying a grayscale intensity sampled from a camera
/// image (mid-gray when no image was available).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColoredPoint {
    pub position: Vector3<f64>,
    pub intensity: u8,
}

fn voxel_key(point: &Vector3<f64>, leaf: f64) -> (i64, i64, i64) {
    (
        (point.x / leaf).floor() as i64,
        (point.y / leaf).floor() as i64,
        (point.z / leaf).floor() as i64,
    )
}

/// Downsample a cloud on a regular grid, keeping one centroid per occupied
/// cell. A non-positive leaf size returns the cloud unchanged.
pub fn voxel_downsample(cloud: &PointCloud, leaf: f64) -> PointCloud {
    if leaf <= 0.0 {
        return cloud.clone();
    }
    let mut cells: HashMap<(i64, i64, i64), (Vector3<f64>, usize)> = HashMap::new();
    for point in &cloud.points {
        let entry = cells
            .entry(voxel_key(point, leaf))
            .or_insert((Vector3::zeros(), 0));
        entry.0 += point;
        entry.1 += 1;
    }
    PointCloud {
        points: cells
            .into_values()
            .map(|(sum, count)| sum / count as f64)
            .collect(),
    }
}

/// Grid downsampling for colored points; intensities average per cell.
pub fn voxel_downsample_colored(points: &[ColoredPoint], leaf: f64) -> Vec<ColoredPoint> {
    if leaf <= 0.0 {
        return points.to_vec();
    }
    let mut cells: HashMap<(i64, i64, i64), (Vector3<f64>, f64, usize)> = HashMap::new();
    for point in points {
        let entry = cells
            .entry(voxel_key(&point.position, leaf))
            .or_insert((Vector3::zeros(), 0.0, 0));
        entry.0 += point.position;
        entry.1 += point.intensity as f64;
        entry.2 += 1;
    }
    cells
        .into_values()
        .map(|(sum, intensity, count)| ColoredPoint {
            position: sum / count as f64,
            intensity: (intensity / count as f64).round() as u8,
        })
        .collect()
}
