//! Geometry utilities: SE3 transforms, camera model, PnP solving.

pub mod camera;
pub mod pnp;
pub mod se3;

pub use camera::CameraModel;
pub use pnp::{solve_pnp_ransac, PnpConfig, PnpResult};
pub use se3::SE3;
