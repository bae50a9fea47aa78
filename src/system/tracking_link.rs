//! The front end's live-state mailbox.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::geometry::SE3;
use crate::map::Timestamp;

/// The front end's most recent pose estimate.
#[derive(Debug, Clone, Copy)]
pub struct TrackingState {
    pub time: Timestamp,
    /// World→body transform of the live frame.
    pub pose: SE3,
}

/// Hand-off point between the real-time front end and the backend.
///
/// The front end publishes its live pose after every tracked frame; the
/// backend rewrites it during forward propagation and bumps the cache
/// generation, which the front end polls to know its derived caches are
/// stale.
#[derive(Debug, Default)]
pub struct TrackingLink {
    state: Mutex<Option<TrackingState>>,
    cache_generation: AtomicU64,
}

impl TrackingLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Front-end side: publish the live estimate.
    pub fn publish(&self, time: Timestamp, pose: SE3) {
        *self.state.lock() = Some(TrackingState { time, pose });
    }

    pub fn snapshot(&self) -> Option<TrackingState> {
        *self.state.lock()
    }

    /// Second stage of the global lock order (rewrite → tracking → map).
    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<TrackingState>> {
        self.state.lock()
    }

    /// Signal that cached state derived from map poses must be rebuilt.
    pub fn mark_stale(&self) {
        self.cache_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Front-end side: compare against a remembered value to detect
    /// corrections.
    pub fn cache_generation(&self) -> u64 {
        self.cache_generation.load(Ordering::SeqCst)
    }
}
