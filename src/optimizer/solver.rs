use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::geometry::SE3;
use crate::optimizer::problem::PoseGraphProblem;

/// Configuration for one bounded solve. The iteration cap is the contract:
/// callers budget work per cycle, never wall time.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub max_iterations: usize,
    /// Relative step-size convergence threshold.
    pub tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            tolerance: 1e-8,
        }
    }
}

/// Outcome of a solve. Partial convergence is a normal result.
#[derive(Debug, Clone, Default)]
pub struct SolveReport {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

const INITIAL_LAMBDA: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const MIN_LAMBDA: f64 = 1e-10;
const MAX_LAMBDA: f64 = 1e10;
const JACOBIAN_EPS: f64 = 1e-6;

/// Levenberg-Marquardt over the problem's free blocks, mutating them in
/// place. Jacobians are central differences on the 7-parameter blocks;
/// robust terms are handled by iteratively reweighted least squares with the
/// weight frozen per outer iteration. Quaternions are renormalized on every
/// accepted step.
pub fn solve_pose_graph(
    problem: &mut PoseGraphProblem,
    config: &SolverConfig,
    should_stop: &dyn Fn() -> bool,
) -> SolveReport {
    let initial_cost = problem.total_cost();
    let mut report = SolveReport {
        initial_cost,
        final_cost: initial_cost,
        iterations: 0,
        converged: false,
    };

    // Free-block bookkeeping: block index → parameter offset.
    let free: Vec<usize> = problem
        .blocks()
        .iter()
        .enumerate()
        .filter(|(_, b)| !b.fixed)
        .map(|(idx, _)| idx)
        .collect();
    let mut offsets: Vec<Option<usize>> = vec![None; problem.num_blocks()];
    for (slot, &block_idx) in free.iter().enumerate() {
        offsets[block_idx] = Some(slot * 7);
    }
    let n = free.len() * 7;
    let m = problem.relative_terms().len() * 6 + problem.prior_terms().len() * 3;
    if n == 0 || m == 0 {
        report.converged = true;
        return report;
    }

    let mut x = DVector::<f64>::zeros(n);
    for (slot, &block_idx) in free.iter().enumerate() {
        let params = problem.blocks()[block_idx].params;
        for p in 0..7 {
            x[slot * 7 + p] = params[p];
        }
    }

    let pose_at = |x: &DVector<f64>, block_idx: usize| -> SE3 {
        match offsets[block_idx] {
            Some(off) => {
                let params = [
                    x[off],
                    x[off + 1],
                    x[off + 2],
                    x[off + 3],
                    x[off + 4],
                    x[off + 5],
                    x[off + 6],
                ];
                SE3::from_params(&params)
            }
            None => problem.blocks()[block_idx].pose(),
        }
    };

    let cost_at = |x: &DVector<f64>| -> f64 {
        let mut cost = 0.0;
        for term in problem.relative_terms() {
            let r = PoseGraphProblem::relative_residual(
                term,
                &pose_at(x, term.i),
                &pose_at(x, term.j),
            );
            cost += term.loss.cost(r.norm_squared());
        }
        for term in problem.prior_terms() {
            let r = PoseGraphProblem::prior_residual(term, &pose_at(x, term.block));
            cost += term.loss.cost(r.norm_squared());
        }
        cost
    };

    let mut lambda = INITIAL_LAMBDA;
    let mut cost = initial_cost;

    for iteration in 0..config.max_iterations {
        if should_stop() {
            debug!("[PoseGraph] stop requested at iteration {iteration}");
            break;
        }
        report.iterations = iteration + 1;

        // Freeze robust weights at the current estimate.
        let rel_weights: Vec<f64> = problem
            .relative_terms()
            .iter()
            .map(|t| {
                let r =
                    PoseGraphProblem::relative_residual(t, &pose_at(&x, t.i), &pose_at(&x, t.j));
                t.loss.sqrt_weight(r.norm_squared())
            })
            .collect();
        let prior_weights: Vec<f64> = problem
            .prior_terms()
            .iter()
            .map(|t| {
                let r = PoseGraphProblem::prior_residual(t, &pose_at(&x, t.block));
                t.loss.sqrt_weight(r.norm_squared())
            })
            .collect();

        let residuals_at = |x: &DVector<f64>| -> DVector<f64> {
            let mut r = DVector::<f64>::zeros(m);
            let mut row = 0;
            for (t_idx, term) in problem.relative_terms().iter().enumerate() {
                let res = PoseGraphProblem::relative_residual(
                    term,
                    &pose_at(x, term.i),
                    &pose_at(x, term.j),
                ) * rel_weights[t_idx];
                for k in 0..6 {
                    r[row + k] = res[k];
                }
                row += 6;
            }
            for (t_idx, term) in problem.prior_terms().iter().enumerate() {
                let res = PoseGraphProblem::prior_residual(term, &pose_at(x, term.block))
                    * prior_weights[t_idx];
                for k in 0..3 {
                    r[row + k] = res[k];
                }
                row += 3;
            }
            r
        };

        let residuals = residuals_at(&x);

        // Central-difference Jacobian, filled block-sparsely: each term only
        // touches the columns of the free blocks it references.
        let mut jacobian = DMatrix::<f64>::zeros(m, n);
        let mut x_work = x.clone();
        let fill_columns = |jacobian: &mut DMatrix<f64>,
                                x_work: &mut DVector<f64>,
                                block_idx: usize,
                                row: usize,
                                dim: usize,
                                eval: &dyn Fn(&DVector<f64>) -> DVector<f64>| {
            let Some(off) = offsets[block_idx] else {
                return;
            };
            for p in 0..7 {
                let col = off + p;
                let saved = x_work[col];
                x_work[col] = saved + JACOBIAN_EPS;
                let plus = eval(x_work);
                x_work[col] = saved - JACOBIAN_EPS;
                let minus = eval(x_work);
                x_work[col] = saved;
                for k in 0..dim {
                    jacobian[(row + k, col)] = (plus[k] - minus[k]) / (2.0 * JACOBIAN_EPS);
                }
            }
        };

        let pose_at_ref = &pose_at;
        let mut row = 0;
        for (t_idx, term) in problem.relative_terms().iter().enumerate() {
            let weight = rel_weights[t_idx];
            let (i, j) = (term.i, term.j);
            let eval = move |x: &DVector<f64>| -> DVector<f64> {
                let res = PoseGraphProblem::relative_residual(
                    term,
                    &pose_at_ref(x, i),
                    &pose_at_ref(x, j),
                ) * weight;
                DVector::from_row_slice(res.as_slice())
            };
            fill_columns(&mut jacobian, &mut x_work, i, row, 6, &eval);
            fill_columns(&mut jacobian, &mut x_work, j, row, 6, &eval);
            row += 6;
        }
        for (t_idx, term) in problem.prior_terms().iter().enumerate() {
            let weight = prior_weights[t_idx];
            let block = term.block;
            let eval = move |x: &DVector<f64>| -> DVector<f64> {
                let res =
                    PoseGraphProblem::prior_residual(term, &pose_at_ref(x, block)) * weight;
                DVector::from_row_slice(res.as_slice())
            };
            fill_columns(&mut jacobian, &mut x_work, block, row, 3, &eval);
            row += 3;
        }

        let jtj = jacobian.transpose() * &jacobian;
        let gradient = jacobian.transpose() * &residuals;

        let mut damped_jtj = jtj.clone();
        for d in 0..n {
            damped_jtj[(d, d)] += lambda * damped_jtj[(d, d)].max(1e-6);
        }

        let Some(delta) = damped_jtj.lu().solve(&(-&gradient)) else {
            lambda = (lambda * LAMBDA_UP).min(MAX_LAMBDA);
            continue;
        };

        // Candidate step with renormalized quaternions.
        let mut x_new = &x + &delta;
        for slot in 0..free.len() {
            let off = slot * 7;
            let params = [
                x_new[off],
                x_new[off + 1],
                x_new[off + 2],
                x_new[off + 3],
                x_new[off + 4],
                x_new[off + 5],
                x_new[off + 6],
            ];
            let normalized = SE3::from_params(&params).to_params();
            for p in 0..7 {
                x_new[off + p] = normalized[p];
            }
        }

        let new_cost = cost_at(&x_new);
        if new_cost < cost {
            debug!(
                "[PoseGraph] iter {}: cost {:.6} -> {:.6}, lambda {:.2e}",
                iteration, cost, new_cost, lambda
            );
            let step_norm = delta.norm();
            x = x_new;
            cost = new_cost;
            lambda = (lambda * LAMBDA_DOWN).max(MIN_LAMBDA);

            if step_norm < config.tolerance * (x.norm() + config.tolerance) {
                report.converged = true;
                break;
            }
        } else {
            lambda *= LAMBDA_UP;
            if lambda > MAX_LAMBDA {
                debug!("[PoseGraph] lambda exhausted at iteration {iteration}");
                break;
            }
        }
    }

    // Write the estimate back into the problem blocks.
    for (slot, &block_idx) in free.iter().enumerate() {
        let off = slot * 7;
        let params = [
            x[off],
            x[off + 1],
            x[off + 2],
            x[off + 3],
            x[off + 4],
            x[off + 5],
            x[off + 6],
        ];
        problem.blocks_mut()[block_idx].params = SE3::from_params(&params).to_params();
    }
    report.final_cost = cost;
    report
}
