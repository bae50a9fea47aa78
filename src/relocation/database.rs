//! Place-recognition descriptor database.

use std::collections::BTreeMap;
use std::fmt;

use crate::map::{Descriptor, Timestamp};

/// Identifier of one database entry, in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DB{}", self.0)
    }
}

/// Appearance index over keyframe descriptors, with the entry-to-timestamp
/// association needed to map matches back into the trajectory.
#[derive(Debug, Default)]
pub struct PlaceDatabase {
    /// Entry id → keyframe timestamp, in insertion order.
    times: Vec<Timestamp>,
    entries: BTreeMap<Timestamp, Vec<Descriptor>>,
}

impl PlaceDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Index a keyframe's descriptors, returning the new entry's id.
    pub fn insert(&mut self, time: Timestamp, descriptors: Vec<Descriptor>) -> EntryId {
        let id = EntryId(self.times.len() as u64);
        self.times.push(time);
        self.entries.insert(time, descriptors);
        id
    }

    pub fn time_of(&self, entry: EntryId) -> Option<Timestamp> {
        self.times.get(entry.0 as usize).copied()
    }

    pub fn descriptors_at(&self, time: Timestamp) -> Option<&[Descriptor]> {
        self.entries.get(&time).map(Vec::as_slice)
    }

    /// Appearance similarity in `[0, 1]` between a descriptor set and the
    /// entry indexed at `time`: mean best-match agreement, 0 when either
    /// side is empty or the time was never indexed.
    pub fn appearance_score(&self, descriptors: &[Descriptor], time: Timestamp) -> f64 {
        let Some(entry) = self.entries.get(&time) else {
            return 0.0;
        };
        if descriptors.is_empty() || entry.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for descriptor in descriptors {
            let best = entry
                .iter()
                .map(|e| descriptor.hamming_distance(e))
                .min()
                .unwrap_or(256);
            total += 1.0 - f64::from(best) / 256.0;
        }
        total / descriptors.len() as f64
    }
}
