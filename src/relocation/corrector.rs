//! Loop-correction commit.
//!
//! Once an episode is verified and both anchors carry their constraints,
//! the corrector rewrites the affected history: the new segment first
//! (seeded from the verified transforms, propagated downstream), then a
//! blending pass over the whole span, re-chaining prior corrections so they
//! compose instead of being overwritten.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::geometry::SE3;
use crate::map::Timestamp;
use crate::mapping::MapRefiner;
use crate::optimizer::{build_relative_chain, solve_pose_graph, ChainNode, SolverConfig};
use crate::system::propagation::Propagator;
use crate::system::shared_state::SharedState;

/// Rewrite history for a verified loop episode.
///
/// `old_time` is the oldest matched historical keyframe, `[start_time,
/// end_time]` the episode span; both episode anchors must already carry
/// their loop constraints. The refiner is parked for the duration and
/// handed the corrected span afterwards.
pub fn correct_loop(
    shared: &Arc<SharedState>,
    refiner: &MapRefiner,
    propagator: &Propagator,
    old_time: Timestamp,
    start_time: Timestamp,
    end_time: Timestamp,
    solver: &SolverConfig,
) {
    if start_time == end_time {
        // single-keyframe episode: the constraint anchors future solves,
        // there is no segment to blend
        info!("[Relocation] single-keyframe loop at {start_time}; no correction");
        return;
    }
    if !refiner.pause() {
        warn!("[Relocation] refiner unavailable; correction skipped");
        return;
    }
    info!("[Relocation] correcting [{start_time}, {end_time}] against {old_time}");

    // Pass 1: the new segment alone, seeded from the verified transforms.
    let (nodes, matched_poses, map_first) = {
        let map = shared.map.read();
        let nodes: Vec<ChainNode> = map
            .range(start_time, None)
            .take_while(|kf| kf.time <= end_time)
            .map(ChainNode::from_keyframe)
            .collect();
        let mut matched_poses = BTreeMap::new();
        for node in &nodes {
            if let Some(constraint) = &node.loop_constraint {
                if let Some(kf) = map.get(constraint.matched_time) {
                    matched_poses.insert(constraint.matched_time, kf.pose);
                }
            }
        }
        (nodes, matched_poses, map.first_time())
    };
    let mut segment = build_relative_chain(&nodes, &matched_poses, map_first);
    solve_pose_graph(&mut segment, solver, &|| false);
    let report = propagator.apply_and_propagate(&segment.solution(), end_time);
    debug!(
        "[Relocation] pass 1 rewrote {} keyframes, {} downstream",
        report.window_written, report.propagated
    );

    // Claim prior-submap interiors out of the blending window and record
    // this correction.
    let (mut span_nodes, span_first) = {
        let map = shared.map.read();
        (
            map.range(old_time, None)
                .take_while(|kf| kf.time <= end_time)
                .map(ChainNode::from_keyframe)
                .collect::<Vec<_>>(),
            map.first_time(),
        )
    };
    let anchors = shared
        .submaps
        .lock()
        .claim_inner_spans(&mut span_nodes, start_time);
    let inner: BTreeMap<Timestamp, SE3> = anchors
        .iter()
        .flat_map(|a| a.claimed.iter().copied())
        .collect();
    shared
        .submaps
        .lock()
        .add_record(old_time, start_time, end_time, inner);

    // Pass 2: blend the whole affected span. The loop anchors stay fixed,
    // so nothing past the window moves and no second propagation is needed.
    let mut blend = build_relative_chain(&span_nodes, &BTreeMap::new(), span_first);
    solve_pose_graph(&mut blend, solver, &|| false);

    {
        let _rewrite = shared.rewrite_lock();
        let mut map = shared.map.write();
        map.apply_poses(&blend.solution());
        // re-chain claimed interiors rigidly to their solved anchors
        for anchor in &anchors {
            let Some(now) = map.get(anchor.anchor_time).map(|kf| kf.pose) else {
                continue;
            };
            let delta = anchor.snapshot.inverse().compose(&now);
            for &(time, pre) in &anchor.claimed {
                if let Some(kf) = map.get_mut(time) {
                    kf.pose = pre.compose(&delta);
                }
            }
        }
    }

    // Regenerate the corrected span's geometry from the new poses.
    refiner.optimize_span(old_time, end_time);
    refiner.resume();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Keyframe, LoopConstraint};
    use crate::mapping::RefinerConfig;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};
    use std::time::Duration;

    fn pose_at(x: f64, y: f64) -> SE3 {
        SE3::new(UnitQuaternion::identity(), Vector3::new(-x, -y, 0.0))
    }

    fn keyframe(t: f64, pose: SE3) -> Keyframe {
        Keyframe::new(Timestamp::new(t), pose)
    }

    struct Fixture {
        shared: Arc<SharedState>,
        refiner: Arc<MapRefiner>,
        propagator: Propagator,
        worker: std::thread::JoinHandle<()>,
    }

    impl Fixture {
        fn new(shared: Arc<SharedState>) -> Self {
            let config = RefinerConfig {
                cycle: Duration::from_millis(5),
                ..RefinerConfig::default()
            };
            let refiner = MapRefiner::new(shared.clone(), None, config);
            let worker = {
                let refiner = refiner.clone();
                std::thread::spawn(move || refiner.run())
            };
            let propagator = Propagator::new(shared.clone());
            Self {
                shared,
                refiner,
                propagator,
                worker,
            }
        }

        fn correct(&self, old: f64, start: f64, end: f64) {
            correct_loop(
                &self.shared,
                &self.refiner,
                &self.propagator,
                Timestamp::new(old),
                Timestamp::new(start),
                Timestamp::new(end),
                &SolverConfig {
                    max_iterations: 5,
                    ..SolverConfig::default()
                },
            );
        }

        fn pose(&self, t: f64) -> SE3 {
            self.shared.map.read().get(Timestamp::new(t)).unwrap().pose
        }

        fn attach_constraint(&self, t: f64, matched: f64, true_pose: &SE3) {
            let mut map = self.shared.map.write();
            let matched_pose = map.get(Timestamp::new(matched)).unwrap().pose;
            let relative = true_pose.compose(&matched_pose.inverse());
            let kf = map.get_mut(Timestamp::new(t)).unwrap();
            kf.loop_constraint = Some(LoopConstraint {
                matched_time: Timestamp::new(matched),
                relative_pose: relative,
                score: 1.0,
            });
        }

        fn finish(self) {
            self.shared.request_shutdown();
            self.refiner.resume();
            self.worker.join().unwrap();
        }
    }

    fn seeded(frames: &[(f64, f64, f64)]) -> Arc<SharedState> {
        let shared = SharedState::new();
        {
            let mut map = shared.map.write();
            for &(t, x, y) in frames {
                map.insert(keyframe(t, pose_at(x, y))).unwrap();
            }
        }
        shared
    }

    #[test]
    fn correction_moves_anchors_to_truth_and_shifts_downstream() {
        // stored trajectory drifted +0.5 in y from t=4 onwards
        let shared = seeded(&[
            (1.0, 0.0, 0.0),
            (2.0, 1.0, 0.0),
            (3.0, 2.0, 0.0),
            (4.0, 3.0, 0.5),
            (5.0, 4.0, 0.5),
            (6.0, 5.0, 0.5),
        ]);
        let fixture = Fixture::new(shared);
        let true4 = pose_at(3.0, 0.0);
        let true5 = pose_at(4.0, 0.0);
        fixture.attach_constraint(4.0, 2.0, &true4);
        fixture.attach_constraint(5.0, 2.0, &true5);
        let stored5 = fixture.pose(5.0);
        let stored6 = fixture.pose(6.0);

        fixture.correct(2.0, 4.0, 5.0);

        // anchors land exactly on the verified geometry
        assert_relative_eq!(fixture.pose(4.0).translation.y, true4.translation.y, epsilon = 1e-9);
        assert_relative_eq!(fixture.pose(5.0).translation.y, true5.translation.y, epsilon = 1e-9);
        // downstream keyframes shift by the end-of-window delta
        let delta = stored5.inverse().compose(&true5);
        let expected6 = stored6.compose(&delta);
        assert_relative_eq!(fixture.pose(6.0).translation.y, expected6.translation.y, epsilon = 1e-9);
        // the commit is on the ledger
        assert_eq!(fixture.shared.submaps.lock().len(), 1);

        fixture.finish();
    }

    #[test]
    fn single_keyframe_episode_skips_the_rewrite() {
        let shared = seeded(&[(1.0, 0.0, 0.0), (2.0, 1.0, 0.0), (3.0, 2.0, 0.0)]);
        let fixture = Fixture::new(shared);
        let before = fixture.pose(3.0);

        fixture.correct(1.0, 3.0, 3.0);

        assert_eq!(fixture.pose(3.0), before);
        assert!(fixture.shared.submaps.lock().is_empty());
        fixture.finish();
    }

    #[test]
    fn nested_corrections_compose_through_the_anchor() {
        let shared = seeded(&[
            (1.0, 0.0, 0.0),
            (2.0, 1.0, 0.0),
            (3.0, 2.0, 0.0),
            (4.0, 3.0, 0.4),
            (5.0, 4.0, 0.4),
            (6.0, 5.0, 0.4),
            (7.0, 6.0, 0.7),
            (8.0, 7.0, 0.7),
        ]);
        let fixture = Fixture::new(shared);

        // first loop over [4, 5]
        fixture.attach_constraint(4.0, 2.0, &pose_at(3.0, 0.0));
        fixture.attach_constraint(5.0, 2.0, &pose_at(4.0, 0.0));
        fixture.correct(2.0, 4.0, 5.0);

        // early history shifts, the way an upstream rewrite would move it;
        // the t=4 anchor now re-seeds away from its current pose
        let shift = SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, -0.5, 0.0));
        {
            let mut map = fixture.shared.map.write();
            for t in [1.0, 2.0, 3.0] {
                let kf = map.get_mut(Timestamp::new(t)).unwrap();
                kf.pose = kf.pose.compose(&shift);
            }
        }

        // second loop over [7, 8]; its blending span envelops the first record
        fixture.attach_constraint(7.0, 2.0, &pose_at(6.0, 0.5));
        fixture.attach_constraint(8.0, 2.0, &pose_at(7.0, 0.5));
        let rel_before = fixture.pose(5.0).compose(&fixture.pose(4.0).inverse());
        let y5_before = fixture.pose(5.0).translation.y;
        fixture.correct(2.0, 7.0, 8.0);

        // t=5 was claimed as the first record's interior: it follows its
        // anchor rigidly, composing the two corrections instead of being
        // re-solved or left behind
        assert!((fixture.pose(5.0).translation.y - y5_before).abs() > 0.4);
        let rel_after = fixture.pose(5.0).compose(&fixture.pose(4.0).inverse());
        assert_relative_eq!(rel_after.translation.x, rel_before.translation.x, epsilon = 1e-9);
        assert_relative_eq!(rel_after.translation.y, rel_before.translation.y, epsilon = 1e-9);
        assert_relative_eq!(rel_after.angle(), rel_before.angle(), epsilon = 1e-9);
        assert_eq!(fixture.shared.submaps.lock().len(), 2);

        fixture.finish();
    }
}
