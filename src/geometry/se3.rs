use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3, Vector6};

/// A rigid transformation in 3D: T = [R | t].
///
/// Used throughout as the world→body pose of a keyframe: applying the
/// transform maps world coordinates into the body frame, and `inverse()`
/// gives the body's position/orientation in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from quaternion components (w, x, y, z) and a translation.
    /// The quaternion is normalized.
    pub fn from_quaternion(w: f64, x: f64, y: f64, z: f64, translation: Vector3<f64>) -> Self {
        let q = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(w, x, y, z));
        Self {
            rotation: q,
            translation,
        }
    }

    /// Build from a rotation matrix and translation vector.
    pub fn from_rt(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    /// Inverse transformation: T⁻¹ = [Rᵀ | -Rᵀt].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Composition: (self ∘ other)(p) = self(other(p)).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Apply the transformation to a point: p' = R·p + t.
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Error vector in the decoupled translation/rotation parameterization:
    /// [t, ω] where ω is the scaled rotation axis. Zero iff identity.
    pub fn log(&self) -> Vector6<f64> {
        let omega = self.rotation.scaled_axis();
        Vector6::new(
            self.translation.x,
            self.translation.y,
            self.translation.z,
            omega.x,
            omega.y,
            omega.z,
        )
    }

    /// Inverse of `log`: builds the transform with R = exp(ω), t as given.
    pub fn exp(tangent: &Vector6<f64>) -> Self {
        let translation = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let omega = Vector3::new(tangent[3], tangent[4], tangent[5]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation,
        }
    }

    /// Flatten to the 7-parameter block layout [tx ty tz qx qy qz qw]
    /// used by the pose-graph solver.
    pub fn to_params(&self) -> [f64; 7] {
        let q = self.rotation.quaternion();
        [
            self.translation.x,
            self.translation.y,
            self.translation.z,
            q.i,
            q.j,
            q.k,
            q.w,
        ]
    }

    /// Rebuild from a 7-parameter block, renormalizing the quaternion.
    pub fn from_params(params: &[f64; 7]) -> Self {
        let q = nalgebra::Quaternion::new(params[6], params[3], params[4], params[5]);
        Self {
            rotation: UnitQuaternion::from_quaternion(q),
            translation: Vector3::new(params[0], params[1], params[2]),
        }
    }

    /// Rotation angle of the transform in radians.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
