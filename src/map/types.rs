use std::cmp::Ordering;
use std::fmt;

/// Unique identifier for a keyframe, assigned by the map in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyframeId(pub u64);

impl KeyframeId {
    pub fn new(id: u64) -> Self {
        KeyframeId(id)
    }
}

impl fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        LandmarkId(id)
    }
}

impl fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LM{}", self.0)
    }
}

/// Keyframe timestamp in seconds. Totally ordered (via `f64::total_cmp`) so
/// it can key the map's ordered containers.
#[derive(Debug, Clone, Copy)]
pub struct Timestamp(pub f64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0.0);

    pub fn new(seconds: f64) -> Self {
        Timestamp(seconds)
    }

    pub fn seconds(self) -> f64 {
        self.0
    }

    /// This timestamp shifted by `dt` seconds (negative shifts backwards).
    pub fn offset(self, dt: f64) -> Timestamp {
        Timestamp(self.0 + dt)
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}
