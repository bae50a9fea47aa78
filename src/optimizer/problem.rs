use std::collections::BTreeMap;

use nalgebra::{Vector3, Vector6};
use tracing::warn;

use crate::geometry::SE3;
use crate::map::Timestamp;

/// Robust loss applied to a term's squared residual norm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Loss {
    Trivial,
    /// Huber loss with the given scale: quadratic inside, linear outside.
    Huber(f64),
}

impl Loss {
    /// Robust cost ρ(s) for squared residual norm s.
    pub fn cost(&self, squared_norm: f64) -> f64 {
        match *self {
            Loss::Trivial => squared_norm,
            Loss::Huber(delta) => {
                if squared_norm <= delta * delta {
                    squared_norm
                } else {
                    2.0 * delta * squared_norm.sqrt() - delta * delta
                }
            }
        }
    }

    /// √ρ'(s): residuals are scaled by this before entering the normal
    /// equations (iteratively reweighted least squares).
    pub fn sqrt_weight(&self, squared_norm: f64) -> f64 {
        match *self {
            Loss::Trivial => 1.0,
            Loss::Huber(delta) => {
                if squared_norm <= delta * delta {
                    1.0
                } else {
                    (delta / squared_norm.sqrt()).sqrt()
                }
            }
        }
    }
}

/// One pose variable: a keyframe's world→body transform flattened to the
/// 7-parameter layout [tx ty tz qx qy qz qw].
#[derive(Debug, Clone)]
pub struct PoseBlock {
    pub time: Timestamp,
    pub params: [f64; 7],
    pub fixed: bool,
}

impl PoseBlock {
    pub fn pose(&self) -> SE3 {
        SE3::from_params(&self.params)
    }
}

/// Pairwise alignment term: the measurement approximates
/// `pose_j ∘ pose_i⁻¹` and the residual is the 6-dim log error.
#[derive(Debug, Clone)]
pub struct RelativePoseTerm {
    pub i: usize,
    pub j: usize,
    pub measurement: SE3,
    pub sqrt_info: f64,
    pub loss: Loss,
}

/// Unary anchor term: pulls a block's body position in world coordinates
/// toward a measured position (satellite fix).
#[derive(Debug, Clone)]
pub struct PositionPriorTerm {
    pub block: usize,
    pub position: Vector3<f64>,
    pub sqrt_info: f64,
    pub loss: Loss,
}

/// An ephemeral pose-graph problem: built fresh for each optimization call,
/// solved, applied, and dropped. Never stored in the map.
#[derive(Debug, Default)]
pub struct PoseGraphProblem {
    blocks: Vec<PoseBlock>,
    index: BTreeMap<Timestamp, usize>,
    relative_terms: Vec<RelativePoseTerm>,
    prior_terms: Vec<PositionPriorTerm>,
}

impl PoseGraphProblem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pose block (or fetch the existing one for this timestamp).
    /// A repeated add can upgrade a block to fixed but never frees one.
    pub fn add_block(&mut self, time: Timestamp, pose: &SE3, fixed: bool) -> usize {
        if let Some(&idx) = self.index.get(&time) {
            self.blocks[idx].fixed |= fixed;
            return idx;
        }
        let idx = self.blocks.len();
        self.blocks.push(PoseBlock {
            time,
            params: pose.to_params(),
            fixed,
        });
        self.index.insert(time, idx);
        idx
    }

    pub fn block_index(&self, time: Timestamp) -> Option<usize> {
        self.index.get(&time).copied()
    }

    pub fn fix_block(&mut self, time: Timestamp) {
        if let Some(&idx) = self.index.get(&time) {
            self.blocks[idx].fixed = true;
        }
    }

    /// Overwrite a block's pose (loop-constraint seeding).
    pub fn set_block_pose(&mut self, time: Timestamp, pose: &SE3) {
        if let Some(&idx) = self.index.get(&time) {
            self.blocks[idx].params = pose.to_params();
        }
    }

    pub fn block_pose(&self, time: Timestamp) -> Option<SE3> {
        self.index.get(&time).map(|&idx| self.blocks[idx].pose())
    }

    pub fn is_fixed(&self, time: Timestamp) -> bool {
        self.index
            .get(&time)
            .map(|&idx| self.blocks[idx].fixed)
            .unwrap_or(false)
    }

    /// Add a pairwise alignment term between two existing blocks. A term
    /// naming an unknown timestamp is dropped with a warning; problem
    /// assembly is never fatal.
    pub fn add_relative_term(
        &mut self,
        time_i: Timestamp,
        time_j: Timestamp,
        measurement: SE3,
        sqrt_info: f64,
        loss: Loss,
    ) {
        let (Some(i), Some(j)) = (self.block_index(time_i), self.block_index(time_j)) else {
            warn!("relative term references unknown block ({time_i}, {time_j}); dropped");
            return;
        };
        self.relative_terms.push(RelativePoseTerm {
            i,
            j,
            measurement,
            sqrt_info,
            loss,
        });
    }

    /// Add a unary position anchor on an existing block.
    pub fn add_position_prior(
        &mut self,
        time: Timestamp,
        position: Vector3<f64>,
        sqrt_info: f64,
        loss: Loss,
    ) {
        let Some(block) = self.block_index(time) else {
            warn!("position prior references unknown block {time}; dropped");
            return;
        };
        self.prior_terms.push(PositionPriorTerm {
            block,
            position,
            sqrt_info,
            loss,
        });
    }

    pub fn blocks(&self) -> &[PoseBlock] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [PoseBlock] {
        &mut self.blocks
    }

    pub fn relative_terms(&self) -> &[RelativePoseTerm] {
        &self.relative_terms
    }

    pub fn prior_terms(&self) -> &[PositionPriorTerm] {
        &self.prior_terms
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_free(&self) -> usize {
        self.blocks.iter().filter(|b| !b.fixed).count()
    }

    pub fn num_terms(&self) -> usize {
        self.relative_terms.len() + self.prior_terms.len()
    }

    /// Raw (information-scaled, pre-loss) residual of a relative term.
    pub fn relative_residual(
        term: &RelativePoseTerm,
        pose_i: &SE3,
        pose_j: &SE3,
    ) -> Vector6<f64> {
        let observed = pose_j.compose(&pose_i.inverse());
        let error = term.measurement.inverse().compose(&observed);
        error.log() * term.sqrt_info
    }

    /// Raw (information-scaled, pre-loss) residual of a position prior.
    pub fn prior_residual(term: &PositionPriorTerm, pose: &SE3) -> Vector3<f64> {
        (pose.inverse().translation - term.position) * term.sqrt_info
    }

    /// Total robust cost at the current block values.
    pub fn total_cost(&self) -> f64 {
        let poses: Vec<SE3> = self.blocks.iter().map(|b| b.pose()).collect();
        let mut cost = 0.0;
        for term in &self.relative_terms {
            let r = Self::relative_residual(term, &poses[term.i], &poses[term.j]);
            cost += term.loss.cost(r.norm_squared());
        }
        for term in &self.prior_terms {
            let r = Self::prior_residual(term, &poses[term.block]);
            cost += term.loss.cost(r.norm_squared());
        }
        cost
    }

    /// Current pose of every block, keyed by timestamp.
    pub fn solution(&self) -> Vec<(Timestamp, SE3)> {
        self.blocks.iter().map(|b| (b.time, b.pose())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn pose(x: f64) -> SE3 {
        SE3::new(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0))
    }

    #[test]
    fn relative_residual_zero_at_satisfied_measurement() {
        let pose_i = pose(1.0);
        let pose_j = pose(3.0);
        let measurement = pose_j.compose(&pose_i.inverse());
        let term = RelativePoseTerm {
            i: 0,
            j: 1,
            measurement,
            sqrt_info: 1.0,
            loss: Loss::Trivial,
        };
        let r = PoseGraphProblem::relative_residual(&term, &pose_i, &pose_j);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn huber_is_quadratic_inside_linear_outside() {
        let loss = Loss::Huber(1.0);
        assert_relative_eq!(loss.cost(0.25), 0.25);
        assert_relative_eq!(loss.sqrt_weight(0.25), 1.0);
        // beyond the scale: cost 2δ√s − δ² and weight δ/√s
        assert_relative_eq!(loss.cost(4.0), 3.0);
        assert_relative_eq!(loss.sqrt_weight(4.0), (0.5f64).sqrt());
    }

    #[test]
    fn add_block_is_idempotent_and_fix_sticks() {
        let mut problem = PoseGraphProblem::new();
        let t = Timestamp::new(1.0);
        let a = problem.add_block(t, &pose(0.0), false);
        let b = problem.add_block(t, &pose(5.0), true);
        assert_eq!(a, b);
        assert_eq!(problem.num_blocks(), 1);
        assert!(problem.is_fixed(t));
        // first add wins on value
        assert_relative_eq!(problem.block_pose(t).unwrap().translation.x, 0.0);
    }

    #[test]
    fn terms_on_unknown_blocks_are_dropped() {
        let mut problem = PoseGraphProblem::new();
        problem.add_block(Timestamp::new(1.0), &pose(0.0), false);
        problem.add_relative_term(
            Timestamp::new(1.0),
            Timestamp::new(2.0),
            SE3::identity(),
            1.0,
            Loss::Trivial,
        );
        problem.add_position_prior(Timestamp::new(9.0), Vector3::zeros(), 1.0, Loss::Trivial);
        assert_eq!(problem.num_terms(), 0);
    }

    #[test]
    fn total_cost_reflects_measurement_violation() {
        let mut problem = PoseGraphProblem::new();
        let t1 = Timestamp::new(1.0);
        let t2 = Timestamp::new(2.0);
        problem.add_block(t1, &pose(0.0), true);
        problem.add_block(t2, &pose(1.0), false);
        // measurement says the blocks should be 2 apart, map says 1
        let measurement = pose(2.0).compose(&pose(0.0).inverse());
        problem.add_relative_term(t1, t2, measurement, 1.0, Loss::Trivial);
        assert!(problem.total_cost() > 0.5);

        problem.set_block_pose(t2, &pose(2.0));
        assert_relative_eq!(problem.total_cost(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn prior_residual_measures_body_position_error() {
        let term = PositionPriorTerm {
            block: 0,
            position: Vector3::new(1.0, 0.0, 0.0),
            sqrt_info: 1.0,
            loss: Loss::Trivial,
        };
        // world→body translation of -1 puts the body at +1: satisfied
        let satisfied = pose(-1.0);
        let r = PoseGraphProblem::prior_residual(&term, &satisfied);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);
    }
}
