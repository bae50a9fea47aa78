//! Pose-graph optimization: ephemeral problems, window assembly, and the
//! bounded Levenberg-Marquardt solver.

pub mod builder;
pub mod problem;
pub mod solver;

pub use builder::{build_relative_chain, build_scan_window, ChainNode, ScanWindowConfig};
pub use problem::{Loss, PoseGraphProblem};
pub use solver::{solve_pose_graph, SolveReport, SolverConfig};
