//! Forward propagation of window corrections.

use std::sync::Arc;

use tracing::debug;

use crate::geometry::SE3;
use crate::map::Timestamp;
use crate::system::shared_state::SharedState;

/// Outcome of one propagate-and-refresh commit.
#[derive(Debug, Clone)]
pub struct PropagationReport {
    /// `old_end⁻¹ ∘ new_end` of the window's last keyframe.
    pub delta: SE3,
    /// Solved window poses written back.
    pub window_written: usize,
    /// Keyframes after the window rewritten by the delta.
    pub propagated: usize,
}

/// The one place that rewrites poses outside an optimization window.
///
/// Every bulk rewrite goes through `apply_and_propagate`, which takes the
/// three shared locks in the fixed global order (rewrite mutex, tracking
/// mutex, map write lock) so the suffix of history and the live front-end
/// pose always move together.
pub struct Propagator {
    shared: Arc<SharedState>,
}

impl Propagator {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    /// Write solved window poses into the map, then right-multiply the
    /// end-of-window delta onto every keyframe after the window and onto the
    /// front end's live pose, and bump the cache generation.
    pub fn apply_and_propagate(
        &self,
        solved: &[(Timestamp, SE3)],
        window_end: Timestamp,
    ) -> PropagationReport {
        let _rewrite = self.shared.rewrite_lock();
        let mut tracking = self.shared.tracking.lock();
        let mut map = self.shared.map.write();

        // Delta from the window's last keyframe: old pose⁻¹ ∘ new pose,
        // computed before the write-back.
        let old_end = map.get(window_end).map(|kf| kf.pose);
        let new_end = solved
            .iter()
            .find(|(time, _)| *time == window_end)
            .map(|(_, pose)| *pose);
        let delta = match (old_end, new_end) {
            (Some(old), Some(new)) => old.inverse().compose(&new),
            _ => SE3::identity(),
        };

        let window_written = map.apply_poses(solved);
        let propagated = map.transform_after(window_end, &delta);

        if let Some(state) = tracking.as_mut() {
            state.pose = state.pose.compose(&delta);
        }
        self.shared.tracking.mark_stale();

        debug!(
            "propagated window end {window_end}: {window_written} window poses, {propagated} after"
        );
        PropagationReport {
            delta,
            window_written,
            propagated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Keyframe;
    use nalgebra::{UnitQuaternion, Vector3};

    fn pose(x: f64) -> SE3 {
        SE3::new(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0))
    }

    fn shared_with_times(times: &[f64]) -> Arc<SharedState> {
        let shared = SharedState::new();
        {
            let mut map = shared.map.write();
            for &t in times {
                map.insert(Keyframe::new(Timestamp::new(t), pose(t)))
                    .unwrap();
            }
        }
        shared
    }

    #[test]
    fn window_poses_apply_and_suffix_shifts() {
        let shared = shared_with_times(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let propagator = Propagator::new(shared.clone());

        // the solve moved the window end from x=3 to x=3.5
        let solved = vec![
            (Timestamp::new(2.0), pose(2.1)),
            (Timestamp::new(3.0), pose(3.5)),
        ];
        let report = propagator.apply_and_propagate(&solved, Timestamp::new(3.0));
        assert_eq!(report.window_written, 2);
        assert_eq!(report.propagated, 2);

        let map = shared.map.read();
        let expected_delta = pose(3.0).inverse().compose(&pose(3.5));
        assert_eq!(report.delta, expected_delta);

        // before the window: untouched
        assert_eq!(map.get(Timestamp::new(1.0)).unwrap().pose, pose(1.0));
        // window: solved values
        assert_eq!(map.get(Timestamp::new(2.0)).unwrap().pose, pose(2.1));
        // after the window: right-multiplied
        assert_eq!(
            map.get(Timestamp::new(4.0)).unwrap().pose,
            pose(4.0).compose(&expected_delta)
        );
        assert_eq!(
            map.get(Timestamp::new(5.0)).unwrap().pose,
            pose(5.0).compose(&expected_delta)
        );
    }

    #[test]
    fn live_pose_moves_with_the_window_end() {
        let shared = shared_with_times(&[1.0, 2.0]);
        shared.tracking.publish(Timestamp::new(2.5), pose(2.5));
        let generation = shared.tracking.cache_generation();

        let propagator = Propagator::new(shared.clone());
        let solved = vec![(Timestamp::new(2.0), pose(2.4))];
        let report = propagator.apply_and_propagate(&solved, Timestamp::new(2.0));

        // relative transform between the live pose and the window end is
        // preserved: live' = live ∘ delta
        let live = shared.tracking.snapshot().unwrap();
        assert_eq!(live.pose, pose(2.5).compose(&report.delta));
        assert_eq!(shared.tracking.cache_generation(), generation + 1);
    }

    #[test]
    fn identity_delta_when_window_end_is_unknown() {
        let shared = shared_with_times(&[1.0]);
        let propagator = Propagator::new(shared.clone());
        let report = propagator.apply_and_propagate(&[], Timestamp::new(99.0));
        assert_eq!(report.delta, SE3::identity());
        assert_eq!(report.window_written, 0);
        assert_eq!(shared.map.read().get(Timestamp::new(1.0)).unwrap().pose, pose(1.0));
    }
}
