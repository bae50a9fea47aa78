use nalgebra::{Vector2, Vector3};

/// Pinhole camera intrinsics. The body frame is the optical frame:
/// z forward, x right, y down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Project a body-frame point to pixel coordinates.
    /// Returns `None` for points at or behind the image plane.
    pub fn project(&self, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        if point.z <= 0.0 {
            return None;
        }
        Some(Vector2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        ))
    }

    /// Back-project a pixel at the given depth into the body frame.
    pub fn unproject(&self, pixel: &Vector2<f64>, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx * depth,
            (pixel.y - self.cy) / self.fy * depth,
            depth,
        )
    }
}
