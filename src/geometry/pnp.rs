use nalgebra::{Matrix2x6, Matrix6, Vector2, Vector3, Vector6};
use rand::Rng;

use crate::geometry::camera::CameraModel;
use crate::geometry::se3::SE3;

/// Configuration for RANSAC pose estimation from 3D-2D correspondences.
#[derive(Debug, Clone)]
pub struct PnpConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Reprojection error threshold in pixels for inlier classification.
    pub inlier_threshold_px: f64,
    /// Minimum number of inliers for a pose to be accepted.
    pub min_inliers: usize,
    /// Desired probability of sampling at least one outlier-free set.
    pub probability: f64,
    /// Gauss-Newton iterations for the final refinement on all inliers.
    pub refine_iterations: usize,
}

impl Default for PnpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            inlier_threshold_px: 8.0,
            min_inliers: 20,
            probability: 0.99,
            refine_iterations: 10,
        }
    }
}

/// Result of a successful PnP estimation.
#[derive(Debug, Clone)]
pub struct PnpResult {
    /// Estimated world→camera pose.
    pub pose: SE3,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Mean reprojection error over the inliers, in pixels.
    pub mean_reproj_error: f64,
}

const SAMPLE_SIZE: usize = 4;
const JACOBIAN_EPS: f64 = 1e-6;
const STEP_DAMPING: f64 = 1e-3;

/// Estimate the world→camera pose from 3D landmark / 2D pixel pairs with
/// RANSAC, seeded from a pose prior.
///
/// Minimal sets are refined from the prior with a few damped Gauss-Newton
/// steps, scored by reprojection inliers, and the best hypothesis is refined
/// on its full inlier set. Returns `None` when there are too few
/// correspondences or no hypothesis reaches `min_inliers`.
pub fn solve_pnp_ransac(
    points: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
    camera: &CameraModel,
    prior: &SE3,
    config: &PnpConfig,
) -> Option<PnpResult> {
    let n = points.len().min(pixels.len());
    if n < SAMPLE_SIZE {
        return None;
    }

    let mut rng = rand::thread_rng();
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut best_pose = *prior;
    let mut max_iterations = config.max_iterations;

    let mut iteration = 0;
    while iteration < max_iterations {
        iteration += 1;

        // Sample a minimal set of distinct correspondence indices.
        let mut sample: Vec<usize> = Vec::with_capacity(SAMPLE_SIZE);
        while sample.len() < SAMPLE_SIZE {
            let idx = rng.gen_range(0..n);
            if !sample.contains(&idx) {
                sample.push(idx);
            }
        }

        let hypothesis = refine_pose(points, pixels, &sample, camera, prior, 5);
        let inliers = find_inliers(points, pixels, camera, &hypothesis, config);

        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            best_pose = hypothesis;

            // Adapt the iteration bound to the observed inlier ratio.
            let inlier_ratio = best_inliers.len() as f64 / n as f64;
            let outlier_free = inlier_ratio.powi(SAMPLE_SIZE as i32);
            if outlier_free > 1e-12 && outlier_free < 1.0 {
                let needed =
                    (1.0 - config.probability).ln() / (1.0 - outlier_free).ln();
                max_iterations = max_iterations.min(needed.ceil() as usize);
            } else if outlier_free >= 1.0 {
                break;
            }
        }
    }

    if best_inliers.len() < config.min_inliers {
        return None;
    }

    // Final refinement over the full inlier set.
    let refined = refine_pose(
        points,
        pixels,
        &best_inliers,
        camera,
        &best_pose,
        config.refine_iterations,
    );
    let inliers = find_inliers(points, pixels, camera, &refined, config);
    if inliers.len() < config.min_inliers {
        return None;
    }

    let mut total_error = 0.0;
    for &i in &inliers {
        if let Some(residual) = reproj_residual(&refined, &points[i], &pixels[i], camera) {
            total_error += residual.norm();
        }
    }
    let mean_reproj_error = total_error / inliers.len() as f64;

    Some(PnpResult {
        pose: refined,
        inliers,
        mean_reproj_error,
    })
}

/// Reprojection residual of one correspondence, `None` when the point falls
/// behind the camera under the given pose.
fn reproj_residual(
    pose: &SE3,
    point: &Vector3<f64>,
    pixel: &Vector2<f64>,
    camera: &CameraModel,
) -> Option<Vector2<f64>> {
    let projected = camera.project(&pose.transform_point(point))?;
    Some(projected - pixel)
}

fn find_inliers(
    points: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
    camera: &CameraModel,
    pose: &SE3,
    config: &PnpConfig,
) -> Vec<usize> {
    let n = points.len().min(pixels.len());
    (0..n)
        .filter(|&i| {
            reproj_residual(pose, &points[i], &pixels[i], camera)
                .map(|r| r.norm() < config.inlier_threshold_px)
                .unwrap_or(false)
        })
        .collect()
}

/// Damped Gauss-Newton refinement of a pose over the given correspondence
/// subset, with central-difference Jacobians on the local [t, ω] update.
fn refine_pose(
    points: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
    indices: &[usize],
    camera: &CameraModel,
    initial: &SE3,
    iterations: usize,
) -> SE3 {
    let mut pose = *initial;

    for _ in 0..iterations {
        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = Vector6::<f64>::zeros();
        let mut valid = 0usize;

        for &i in indices {
            let Some(residual) = reproj_residual(&pose, &points[i], &pixels[i], camera) else {
                continue;
            };

            let mut jacobian = Matrix2x6::<f64>::zeros();
            let mut complete = true;
            for k in 0..6 {
                let mut delta = Vector6::zeros();
                delta[k] = JACOBIAN_EPS;
                let plus = SE3::exp(&delta).compose(&pose);
                delta[k] = -JACOBIAN_EPS;
                let minus = SE3::exp(&delta).compose(&pose);

                let (Some(r_plus), Some(r_minus)) = (
                    reproj_residual(&plus, &points[i], &pixels[i], camera),
                    reproj_residual(&minus, &points[i], &pixels[i], camera),
                ) else {
                    complete = false;
                    break;
                };
                let column = (r_plus - r_minus) / (2.0 * JACOBIAN_EPS);
                jacobian.set_column(k, &column);
            }
            if !complete {
                continue;
            }

            jtj += jacobian.transpose() * jacobian;
            jtr += jacobian.transpose() * residual;
            valid += 1;
        }

        if valid < 3 {
            break;
        }

        let mut damped = jtj;
        for d in 0..6 {
            damped[(d, d)] += STEP_DAMPING * damped[(d, d)].max(1e-6);
        }
        let Some(step) = damped.lu().solve(&(-jtr)) else {
            break;
        };

        pose = SE3::exp(&step).compose(&pose);
        if step.norm() < 1e-10 {
            break;
        }
    }

    pose
}
