use std::collections::BTreeMap;

use tracing::debug;

use crate::cloud::{icp_align, IcpConfig, PointCloud};
use crate::geometry::SE3;
use crate::map::{Keyframe, KeyframeMap, LoopConstraint, Timestamp};
use crate::optimizer::problem::{Loss, PoseGraphProblem};

/// Configuration for scan-window problem assembly.
#[derive(Debug, Clone)]
pub struct ScanWindowConfig {
    /// Number of fixed boundary keyframes pulled in ahead of the window, and
    /// the per-keyframe association span.
    pub associations: usize,
    /// Huber scale for scan-alignment residuals.
    pub huber_scale: f64,
    /// Weight for satellite-fix position priors.
    pub navsat_weight: f64,
    pub icp: IcpConfig,
}

impl Default for ScanWindowConfig {
    fn default() -> Self {
        Self {
            associations: 4,
            huber_scale: 0.1,
            navsat_weight: 1.0,
            icp: IcpConfig::default(),
        }
    }
}

fn inside_committed_span(spans: &[(Timestamp, Timestamp)], time: Timestamp) -> bool {
    spans.iter().any(|&(start, end)| start < time && time <= end)
}

/// Register one keyframe pair, returning the relative-pose measurement
/// `pose_source ∘ pose_target⁻¹` on success.
fn register_pair(
    source: &Keyframe,
    target: &Keyframe,
    source_cloud: &PointCloud,
    target_cloud: &PointCloud,
    icp: &IcpConfig,
) -> Option<SE3> {
    let initial = target.pose.compose(&source.pose.inverse());
    let result = icp_align(source_cloud, target_cloud, &initial, icp)?;
    if !result.converged {
        return None;
    }
    Some(result.transform.inverse())
}

/// Assemble the mapping window problem over keyframes in `[start, end]`:
/// fixed boundary blocks, pairwise scan-alignment terms against up to
/// `associations` predecessors (falling back to the true chronological
/// predecessor when a candidate sits inside an already-committed submap),
/// loop-constraint and gauge fixing, satellite priors. Runs under the map
/// read lock; the returned problem is self-contained.
pub fn build_scan_window(
    map: &KeyframeMap,
    start: Timestamp,
    end: Timestamp,
    submap_spans: &[(Timestamp, Timestamp)],
    config: &ScanWindowConfig,
) -> PoseGraphProblem {
    let mut problem = PoseGraphProblem::new();
    let window: Vec<&Keyframe> = map
        .range(start, None)
        .take_while(|kf| kf.time <= end)
        .collect();
    if window.is_empty() {
        return problem;
    }

    // Boundary keyframes enter as fixed blocks and association targets.
    let boundary = map.last_before(window[0].time, config.associations);
    for kf in &boundary {
        problem.add_block(kf.time, &kf.pose, true);
    }
    for kf in &window {
        problem.add_block(kf.time, &kf.pose, false);
    }

    // Gauge: the trajectory origin never moves.
    if map.first_time() == Some(window[0].time) {
        problem.fix_block(window[0].time);
    }

    // Verified loop constraints pin their keyframe and its match.
    for kf in &window {
        if let Some(constraint) = &kf.loop_constraint {
            problem.fix_block(kf.time);
            problem.fix_block(constraint.matched_time);
        }
    }

    // Scan associations. `recent` holds the association candidates, oldest
    // first, seeded with the boundary.
    let mut recent: Vec<&Keyframe> = boundary.clone();
    for &kf in &window {
        if let Some(scan) = &kf.scan {
            let source_cloud = scan.merged();
            let mut targets: Vec<&Keyframe> = Vec::new();
            for &candidate in recent.iter().rev().take(config.associations) {
                let target = if inside_committed_span(submap_spans, candidate.time) {
                    // Stale mid-submap pose: fall back to the true
                    // chronological predecessor.
                    match map.nearest_before(kf.time) {
                        Some(prev) => prev,
                        None => continue,
                    }
                } else {
                    candidate
                };
                if target.time != kf.time && !targets.iter().any(|t| t.time == target.time) {
                    targets.push(target);
                }
            }

            for target in targets {
                let Some(target_scan) = &target.scan else {
                    continue;
                };
                if problem.block_index(target.time).is_none() {
                    // Fallback predecessors outside the window enter fixed.
                    problem.add_block(target.time, &target.pose, true);
                }
                match register_pair(kf, target, &source_cloud, &target_scan.merged(), &config.icp)
                {
                    Some(measurement) => {
                        problem.add_relative_term(
                            target.time,
                            kf.time,
                            measurement,
                            1.0,
                            Loss::Huber(config.huber_scale),
                        );
                    }
                    None => {
                        debug!(
                            "scan association {} -> {} did not converge",
                            kf.time, target.time
                        );
                    }
                }
            }
        } else if let Some(prev) = recent.last() {
            // No scan payload: preserve the current relative pose to the
            // predecessor so the frame moves coherently with the window.
            let measurement = kf.pose.compose(&prev.pose.inverse());
            problem.add_relative_term(prev.time, kf.time, measurement, 1.0, Loss::Trivial);
        }

        if let Some(navsat) = &kf.navsat {
            problem.add_position_prior(
                kf.time,
                navsat.position,
                config.navsat_weight,
                Loss::Huber(1.0),
            );
        }

        recent.push(kf);
    }

    debug!(
        "scan window [{start}, {end}]: {} blocks ({} free), {} terms",
        problem.num_blocks(),
        problem.num_free(),
        problem.num_terms()
    );
    problem
}

/// One keyframe snapshot feeding the relative-chain builder.
#[derive(Debug, Clone)]
pub struct ChainNode {
    pub time: Timestamp,
    pub pose: SE3,
    pub loop_constraint: Option<LoopConstraint>,
}

impl ChainNode {
    pub fn from_keyframe(kf: &Keyframe) -> Self {
        Self {
            time: kf.time,
            pose: kf.pose,
            loop_constraint: kf.loop_constraint,
        }
    }
}

/// Assemble a relative-pose chain over the given (already filtered) window
/// snapshots: consecutive measurements taken from the poses as collected,
/// loop-constrained keyframes seeded from their verified transforms and
/// fixed, matched historical keyframes fixed, origin gauge fixed.
///
/// `extra_poses` supplies poses of matched keyframes that lie outside the
/// node list (the first correction pass, where matches precede the window).
pub fn build_relative_chain(
    nodes: &[ChainNode],
    extra_poses: &BTreeMap<Timestamp, SE3>,
    map_first_time: Option<Timestamp>,
) -> PoseGraphProblem {
    let mut problem = PoseGraphProblem::new();
    if nodes.is_empty() {
        return problem;
    }

    for node in nodes {
        problem.add_block(node.time, &node.pose, false);
    }
    if map_first_time == Some(nodes[0].time) {
        problem.fix_block(nodes[0].time);
    }

    // Measurements from the collected poses, before any seeding.
    for pair in nodes.windows(2) {
        let measurement = pair[1].pose.compose(&pair[0].pose.inverse());
        problem.add_relative_term(pair[0].time, pair[1].time, measurement, 1.0, Loss::Trivial);
    }

    // Seed loop keyframes at their verified poses and pin both ends.
    for node in nodes {
        let Some(constraint) = &node.loop_constraint else {
            continue;
        };
        let matched_pose = nodes
            .iter()
            .find(|n| n.time == constraint.matched_time)
            .map(|n| n.pose)
            .or_else(|| extra_poses.get(&constraint.matched_time).copied());
        let Some(matched_pose) = matched_pose else {
            debug!(
                "loop constraint at {} references unknown match {}",
                node.time, constraint.matched_time
            );
            continue;
        };
        let seeded = constraint.relative_pose.compose(&matched_pose);
        problem.set_block_pose(node.time, &seeded);
        problem.fix_block(node.time);
        problem.fix_block(constraint.matched_time);
    }

    problem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::ScanFeatures;
    use nalgebra::{UnitQuaternion, Vector3};

    fn pose_at_x(x: f64) -> SE3 {
        // world→body translation of -x puts the body at +x
        SE3::new(UnitQuaternion::identity(), Vector3::new(-x, 0.0, 0.0))
    }

    fn world_lattice() -> PointCloud {
        let mut points = Vec::new();
        for x in 0..5 {
            for y in 0..4 {
                for z in 0..2 {
                    points.push(Vector3::new(
                        x as f64 * 1.2,
                        y as f64 * 1.5,
                        z as f64 * 2.0 + 1.0,
                    ));
                }
            }
        }
        PointCloud::from_points(points)
    }

    /// A map of scan keyframes at the given body x positions, each observing
    /// the same world lattice from its own pose.
    fn scan_map(positions: &[f64]) -> KeyframeMap {
        let world = world_lattice();
        let mut map = KeyframeMap::new();
        for (i, &x) in positions.iter().enumerate() {
            let pose = pose_at_x(x);
            let body_cloud = world.transformed(&pose);
            let mut kf = Keyframe::new(Timestamp::new(i as f64 + 1.0), pose);
            kf.scan = Some(ScanFeatures::new(body_cloud, PointCloud::new()));
            map.insert(kf).unwrap();
        }
        map
    }

    #[test]
    fn boundary_keyframes_enter_fixed() {
        let map = scan_map(&[0.0, 0.2, 0.4, 0.6, 0.8, 1.0]);
        let problem = build_scan_window(
            &map,
            Timestamp::new(5.0),
            Timestamp::new(6.0),
            &[],
            &ScanWindowConfig::default(),
        );

        for t in [1.0, 2.0, 3.0, 4.0] {
            assert!(problem.is_fixed(Timestamp::new(t)), "boundary t={t}");
        }
        assert!(!problem.is_fixed(Timestamp::new(5.0)));
        assert!(!problem.is_fixed(Timestamp::new(6.0)));
        assert!(problem.num_terms() > 0);
    }

    #[test]
    fn window_at_trajectory_origin_is_gauge_fixed() {
        let map = scan_map(&[0.0, 0.2, 0.4]);
        let problem = build_scan_window(
            &map,
            Timestamp::new(1.0),
            Timestamp::new(3.0),
            &[],
            &ScanWindowConfig::default(),
        );
        assert!(problem.is_fixed(Timestamp::new(1.0)));
        assert!(!problem.is_fixed(Timestamp::new(2.0)));
    }

    #[test]
    fn loop_constrained_keyframe_and_match_are_fixed() {
        let mut map = scan_map(&[0.0, 0.2, 0.4, 0.6, 0.8, 1.0]);
        let constraint = LoopConstraint {
            matched_time: Timestamp::new(2.0),
            relative_pose: SE3::identity(),
            score: 1.0,
        };
        map.get_mut(Timestamp::new(6.0)).unwrap().loop_constraint = Some(constraint);

        let problem = build_scan_window(
            &map,
            Timestamp::new(5.0),
            Timestamp::new(6.0),
            &[],
            &ScanWindowConfig::default(),
        );
        assert!(problem.is_fixed(Timestamp::new(6.0)));
        assert!(problem.is_fixed(Timestamp::new(2.0)));
    }

    #[test]
    fn submap_interior_candidate_falls_back_to_predecessor() {
        let map = scan_map(&[0.0, 0.2, 0.4, 0.6, 0.8, 1.0]);
        // keyframes at t=2..4 are interior to a committed submap
        let spans = vec![(Timestamp::new(1.0), Timestamp::new(4.0))];
        let problem = build_scan_window(
            &map,
            Timestamp::new(5.0),
            Timestamp::new(6.0),
            &spans,
            &ScanWindowConfig::default(),
        );

        // no association may target the stale interior keyframes
        for term in problem.relative_terms() {
            let target_time = problem.blocks()[term.i].time;
            assert!(
                !(target_time > Timestamp::new(1.0) && target_time < Timestamp::new(5.0))
                    || target_time == Timestamp::new(4.0),
                "unexpected association target {target_time}"
            );
        }
        // t=5 keeps an association with its true predecessor t=4
        let has_pred_term = problem.relative_terms().iter().any(|term| {
            problem.blocks()[term.i].time == Timestamp::new(4.0)
                && problem.blocks()[term.j].time == Timestamp::new(5.0)
        });
        assert!(has_pred_term);
    }

    #[test]
    fn scan_terms_vanish_at_true_poses() {
        let map = scan_map(&[0.0, 0.3, 0.6, 0.9, 1.2, 1.5]);
        let problem = build_scan_window(
            &map,
            Timestamp::new(5.0),
            Timestamp::new(6.0),
            &[],
            &ScanWindowConfig::default(),
        );
        // clouds encode the exact geometry the poses already satisfy
        assert!(problem.num_terms() > 0);
        assert!(problem.total_cost() < 1e-6);
    }

    #[test]
    fn chain_preserves_collected_relatives_and_seeds_loops() {
        let nodes = vec![
            ChainNode {
                time: Timestamp::new(10.0),
                pose: pose_at_x(0.0),
                loop_constraint: None,
            },
            ChainNode {
                time: Timestamp::new(11.0),
                pose: pose_at_x(1.0),
                loop_constraint: None,
            },
            ChainNode {
                time: Timestamp::new(12.0),
                pose: pose_at_x(2.0),
                loop_constraint: Some(LoopConstraint {
                    matched_time: Timestamp::new(1.0),
                    relative_pose: SE3::identity(),
                    score: 1.0,
                }),
            },
        ];
        let mut extra = BTreeMap::new();
        let old_pose = pose_at_x(1.9);
        extra.insert(Timestamp::new(1.0), old_pose);

        let problem = build_relative_chain(&nodes, &extra, Some(Timestamp::new(1.0)));

        // the loop keyframe is seeded at relative ∘ matched and fixed
        assert!(problem.is_fixed(Timestamp::new(12.0)));
        let seeded = problem.block_pose(Timestamp::new(12.0)).unwrap();
        assert!((seeded.translation - old_pose.translation).norm() < 1e-12);

        // consecutive measurements reflect the collected poses: moving the
        // free middle block away raises the cost
        assert_eq!(problem.relative_terms().len(), 2);
        assert!(problem.total_cost() > 0.0); // seeding broke the last relative
    }

    #[test]
    fn chain_gauge_fixes_trajectory_origin() {
        let nodes = vec![
            ChainNode {
                time: Timestamp::new(1.0),
                pose: pose_at_x(0.0),
                loop_constraint: None,
            },
            ChainNode {
                time: Timestamp::new(2.0),
                pose: pose_at_x(1.0),
                loop_constraint: None,
            },
        ];
        let problem = build_relative_chain(&nodes, &BTreeMap::new(), Some(Timestamp::new(1.0)));
        assert!(problem.is_fixed(Timestamp::new(1.0)));
        assert!(!problem.is_fixed(Timestamp::new(2.0)));
    }
}
