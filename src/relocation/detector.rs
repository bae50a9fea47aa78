//! Geometric loop-candidate detection.

use nalgebra::Vector3;

use crate::map::{Keyframe, KeyframeMap, Timestamp};

#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Planar distance under which a historical keyframe counts as the
    /// same place.
    pub distance_threshold: f64,
    /// Minimum age before a keyframe becomes a candidate; keeps recent
    /// history out of the search.
    pub exclusion_margin: f64,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 10.0,
            exclusion_margin: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopCandidate {
    pub matched_time: Timestamp,
    pub distance: f64,
}

fn planar_distance(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

/// Find the historical keyframe nearest to `frame` (height ignored),
/// accepting it only when the candidate's chronological neighbors on both
/// sides are themselves within the distance threshold. The shape check
/// rejects spurious proximity where an unrelated part of the trajectory
/// merely crosses the current position.
pub fn detect_candidate(
    map: &KeyframeMap,
    frame: &Keyframe,
    config: &LoopDetectorConfig,
) -> Option<LoopCandidate> {
    let horizon = frame.time.offset(-config.exclusion_margin);
    let position = frame.position();
    let mut best: Option<LoopCandidate> = None;

    for candidate in map.iter().take_while(|kf| kf.time < horizon) {
        let distance = planar_distance(&position, &candidate.position());
        if distance >= config.distance_threshold {
            continue;
        }
        if best.is_some_and(|b| b.distance <= distance) {
            continue;
        }
        let Some(prev) = map.nearest_before(candidate.time) else {
            continue;
        };
        let Some(next) = map.nearest_after(candidate.time) else {
            continue;
        };
        // both neighbors must be historical and at the same place
        if next.time >= horizon {
            continue;
        }
        if planar_distance(&position, &prev.position()) >= config.distance_threshold
            || planar_distance(&position, &next.position()) >= config.distance_threshold
        {
            continue;
        }
        best = Some(LoopCandidate {
            matched_time: candidate.time,
            distance,
        });
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use nalgebra::UnitQuaternion;

    fn keyframe_at(t: f64, x: f64, y: f64) -> Keyframe {
        let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(-x, -y, 0.0));
        Keyframe::new(Timestamp::new(t), pose)
    }

    fn map_of(frames: &[(f64, f64, f64)]) -> KeyframeMap {
        let mut map = KeyframeMap::new();
        for &(t, x, y) in frames {
            map.insert(keyframe_at(t, x, y)).unwrap();
        }
        map
    }

    #[test]
    fn picks_the_nearest_qualifying_candidate() {
        let map = map_of(&[
            (1.0, 0.0, 0.0),
            (2.0, 2.0, 0.0),
            (3.0, 4.0, 0.0),
            (4.0, 6.0, 0.0),
        ]);
        let frame = keyframe_at(20.0, 2.5, 1.0);
        let candidate = detect_candidate(&map, &frame, &LoopDetectorConfig::default()).unwrap();
        assert_eq!(candidate.matched_time, Timestamp::new(2.0));
    }

    #[test]
    fn neighbors_out_of_threshold_disqualify_a_near_candidate() {
        // t=2 passes right by the query, but its neighbors are far away:
        // an unrelated crossing, not a revisit
        let map = map_of(&[(1.0, 50.0, 0.0), (2.0, 1.0, 0.0), (3.0, 50.0, 0.0)]);
        let frame = keyframe_at(20.0, 0.0, 0.0);
        assert_eq!(
            detect_candidate(&map, &frame, &LoopDetectorConfig::default()),
            None
        );
    }

    #[test]
    fn recent_history_is_never_matched() {
        let map = map_of(&[(14.0, 0.0, 0.0), (15.0, 1.0, 0.0), (16.0, 2.0, 0.0)]);
        let frame = keyframe_at(20.0, 1.0, 0.0);
        assert_eq!(
            detect_candidate(&map, &frame, &LoopDetectorConfig::default()),
            None
        );
    }

    #[test]
    fn endpoint_candidates_without_neighbors_are_skipped() {
        // the first keyframe has no predecessor; the next one qualifies
        let map = map_of(&[(1.0, 0.2, 0.0), (2.0, 0.6, 0.0), (3.0, 1.0, 0.0), (4.0, 1.4, 0.0)]);
        let frame = keyframe_at(20.0, 0.0, 0.0);
        let candidate = detect_candidate(&map, &frame, &LoopDetectorConfig::default()).unwrap();
        assert_eq!(candidate.matched_time, Timestamp::new(2.0));
    }
}
