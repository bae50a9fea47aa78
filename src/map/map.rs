use std::collections::BTreeMap;
use std::ops::Bound;

use thiserror::Error;
use tracing::debug;

use crate::geometry::SE3;
use crate::map::keyframe::Keyframe;
use crate::map::types::{KeyframeId, Timestamp};

/// Rejection reasons for keyframe insertion. Timestamps key the map and must
/// be strictly increasing.
#[derive(Debug, Error, PartialEq)]
pub enum MapError {
    #[error("keyframe at {0} already exists")]
    DuplicateTimestamp(Timestamp),
    #[error("keyframe at {time} is not newer than the map tail at {tail}")]
    NonMonotonicTimestamp { time: Timestamp, tail: Timestamp },
}

/// The keyframe map: every keyframe the system has ever created, keyed by
/// timestamp. This is a plain container; `SharedState` wraps it in a single
/// map-wide `RwLock`, and consumers follow a collect (read lock) / solve
/// (no lock) / apply (write lock) discipline.
#[derive(Debug, Default)]
pub struct KeyframeMap {
    frames: BTreeMap<Timestamp, Keyframe>,
    next_id: u64,
}

impl KeyframeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a keyframe, assigning its id. Fails if the timestamp is not
    /// strictly greater than every timestamp already in the map.
    pub fn insert(&mut self, mut keyframe: Keyframe) -> Result<KeyframeId, MapError> {
        if self.frames.contains_key(&keyframe.time) {
            return Err(MapError::DuplicateTimestamp(keyframe.time));
        }
        if let Some((&tail, _)) = self.frames.last_key_value() {
            if keyframe.time <= tail {
                return Err(MapError::NonMonotonicTimestamp {
                    time: keyframe.time,
                    tail,
                });
            }
        }

        let id = KeyframeId::new(self.next_id);
        self.next_id += 1;
        keyframe.id = id;
        debug!("inserted {} at t={}", id, keyframe.time);
        self.frames.insert(keyframe.time, keyframe);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, time: Timestamp) -> Option<&Keyframe> {
        self.frames.get(&time)
    }

    pub fn get_mut(&mut self, time: Timestamp) -> Option<&mut Keyframe> {
        self.frames.get_mut(&time)
    }

    pub fn first(&self) -> Option<&Keyframe> {
        self.frames.values().next()
    }

    pub fn last(&self) -> Option<&Keyframe> {
        self.frames.values().next_back()
    }

    pub fn first_time(&self) -> Option<Timestamp> {
        self.frames.keys().next().copied()
    }

    pub fn last_time(&self) -> Option<Timestamp> {
        self.frames.keys().next_back().copied()
    }

    /// Keyframes in `[start, end)`, oldest first. `end = None` runs to the
    /// end of the map.
    pub fn range(
        &self,
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> impl Iterator<Item = &Keyframe> {
        let upper = match end {
            Some(t) => Bound::Excluded(t),
            None => Bound::Unbounded,
        };
        self.frames
            .range((Bound::Included(start), upper))
            .map(|(_, kf)| kf)
    }

    /// Keyframes in `(after, upto]`, oldest first: the cursor-advance query
    /// used by the background consumers.
    pub fn window(&self, after: Timestamp, upto: Timestamp) -> impl Iterator<Item = &Keyframe> {
        self.frames
            .range((Bound::Excluded(after), Bound::Included(upto)))
            .map(|(_, kf)| kf)
    }

    /// The up-to-`limit` keyframes immediately before `time` (exclusive),
    /// oldest first.
    pub fn last_before(&self, time: Timestamp, limit: usize) -> Vec<&Keyframe> {
        let mut found: Vec<&Keyframe> = self
            .frames
            .range((Bound::Unbounded, Bound::Excluded(time)))
            .rev()
            .take(limit)
            .map(|(_, kf)| kf)
            .collect();
        found.reverse();
        found
    }

    /// The up-to-`limit` keyframes strictly after `time`, oldest first.
    pub fn first_after(&self, time: Timestamp, limit: usize) -> Vec<&Keyframe> {
        self.frames
            .range((Bound::Excluded(time), Bound::Unbounded))
            .take(limit)
            .map(|(_, kf)| kf)
            .collect()
    }

    /// The closest keyframe strictly before `time`.
    pub fn nearest_before(&self, time: Timestamp) -> Option<&Keyframe> {
        self.frames
            .range((Bound::Unbounded, Bound::Excluded(time)))
            .next_back()
            .map(|(_, kf)| kf)
    }

    /// The closest keyframe strictly after `time`.
    pub fn nearest_after(&self, time: Timestamp) -> Option<&Keyframe> {
        self.frames
            .range((Bound::Excluded(time), Bound::Unbounded))
            .next()
            .map(|(_, kf)| kf)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keyframe> {
        self.frames.values()
    }

    /// Overwrite poses from solved results. Entries whose timestamp is no
    /// longer present are skipped. Returns the number of poses written.
    pub fn apply_poses(&mut self, poses: &[(Timestamp, SE3)]) -> usize {
        let mut written = 0;
        for (time, pose) in poses {
            if let Some(kf) = self.frames.get_mut(time) {
                kf.pose = *pose;
                written += 1;
            }
        }
        written
    }

    /// Right-multiply `delta` onto the pose of every keyframe strictly after
    /// `after` (forward propagation of a window correction). Returns the
    /// number of keyframes rewritten.
    pub fn transform_after(&mut self, after: Timestamp, delta: &SE3) -> usize {
        let mut rewritten = 0;
        for (_, kf) in self
            .frames
            .range_mut((Bound::Excluded(after), Bound::Unbounded))
        {
            kf.pose = kf.pose.compose(delta);
            rewritten += 1;
        }
        rewritten
    }
}
