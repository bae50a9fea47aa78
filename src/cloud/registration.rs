use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Matrix3, Vector3};

use crate::cloud::PointCloud;
use crate::geometry::SE3;

/// Configuration for iterative closest point alignment.
#[derive(Debug, Clone)]
pub struct IcpConfig {
    pub max_iterations: usize,
    /// Correspondences farther than this are discarded.
    pub max_correspondence_distance: f64,
    /// Convergence threshold on the per-iteration translation update.
    pub translation_epsilon: f64,
    /// Convergence threshold on the per-iteration rotation update (radians).
    pub rotation_epsilon: f64,
    /// Minimum correspondences needed to estimate an update.
    pub min_correspondences: usize,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_correspondence_distance: 1.0,
            translation_epsilon: 1e-4,
            rotation_epsilon: 1e-4,
            min_correspondences: 10,
        }
    }
}

/// Outcome of an ICP run. `transform` maps source-frame points into the
/// target frame (the initial guess folded in).
#[derive(Debug, Clone)]
pub struct IcpResult {
    pub transform: SE3,
    /// Fraction of source points with a gated correspondence at the final
    /// transform.
    pub fitness: f64,
    /// RMS distance over those correspondences.
    pub inlier_rmse: f64,
    pub iterations: usize,
    /// Whether the update fell below the convergence thresholds before the
    /// iteration cap.
    pub converged: bool,
}

/// Point-to-point ICP: alternate nearest-neighbor association (k-d tree over
/// the target) with a closed-form rigid update until convergence or the
/// iteration cap. Returns `None` when either cloud is too small or the
/// association collapses below `min_correspondences`.
pub fn icp_align(
    source: &PointCloud,
    target: &PointCloud,
    initial: &SE3,
    config: &IcpConfig,
) -> Option<IcpResult> {
    if source.len() < config.min_correspondences || target.len() < config.min_correspondences {
        return None;
    }

    let mut tree: KdTree<f64, 3> = KdTree::new();
    for (i, point) in target.points.iter().enumerate() {
        tree.add(&[point.x, point.y, point.z], i as u64);
    }

    let gate_sq = config.max_correspondence_distance * config.max_correspondence_distance;
    let mut transform = *initial;
    let mut converged = false;
    let mut iterations = 0;

    for _ in 0..config.max_iterations {
        iterations += 1;

        let mut moved_points = Vec::new();
        let mut matched_points = Vec::new();
        for point in &source.points {
            let moved = transform.transform_point(point);
            let nearest = tree.nearest_one::<SquaredEuclidean>(&[moved.x, moved.y, moved.z]);
            if nearest.distance <= gate_sq {
                moved_points.push(moved);
                matched_points.push(target.points[nearest.item as usize]);
            }
        }
        if moved_points.len() < config.min_correspondences {
            return None;
        }

        let step = best_fit_transform(&moved_points, &matched_points)?;
        transform = step.compose(&transform);

        if step.translation.norm() < config.translation_epsilon
            && step.angle() < config.rotation_epsilon
        {
            converged = true;
            break;
        }
    }

    // Fitness statistics at the final transform.
    let mut matched = 0usize;
    let mut squared_sum = 0.0;
    for point in &source.points {
        let moved = transform.transform_point(point);
        let nearest = tree.nearest_one::<SquaredEuclidean>(&[moved.x, moved.y, moved.z]);
        if nearest.distance <= gate_sq {
            matched += 1;
            squared_sum += nearest.distance;
        }
    }
    if matched == 0 {
        return None;
    }

    Some(IcpResult {
        transform,
        fitness: matched as f64 / source.len() as f64,
        inlier_rmse: (squared_sum / matched as f64).sqrt(),
        iterations,
        converged,
    })
}

/// Closed-form least-squares rigid transform aligning `source` onto `target`
/// (Horn's method via SVD, with the reflection case corrected).
fn best_fit_transform(source: &[Vector3<f64>], target: &[Vector3<f64>]) -> Option<SE3> {
    let n = source.len().min(target.len());
    if n < 3 {
        return None;
    }

    let centroid_src: Vector3<f64> = source.iter().copied().sum::<Vector3<f64>>() / n as f64;
    let centroid_dst: Vector3<f64> = target.iter().copied().sum::<Vector3<f64>>() / n as f64;

    let mut cross_cov = Matrix3::<f64>::zeros();
    for i in 0..n {
        let s = source[i] - centroid_src;
        let d = target[i] - centroid_dst;
        cross_cov += d * s.transpose();
    }

    let svd = cross_cov.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        // Reflection case: flip the axis of least variance.
        let mut u_fixed = u;
        u_fixed.set_column(2, &(-u.column(2)));
        rotation = u_fixed * v_t;
    }
    let translation = centroid_dst - rotation * centroid_src;
    Some(SE3::from_rt(&rotation, translation))
}
