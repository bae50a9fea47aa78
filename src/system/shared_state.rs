//! Shared state between the front end and the background consumers.
//!
//! The `SharedState` struct holds all data accessed by multiple threads,
//! protected by appropriate synchronization primitives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::warn;

use crate::map::{KeyframeMap, LandmarkStore, Timestamp};
use crate::relocation::SubmapLedger;
use crate::system::tracking_link::TrackingLink;

/// State shared between the front end, the map refiner, and the relocation
/// engine.
///
/// The keyframe map sits behind a single map-wide `RwLock`; consumers follow
/// the collect (read) / solve (unlocked) / apply (write) discipline. Bulk
/// pose rewrites additionally serialize on the rewrite mutex, and the fixed
/// global lock order is rewrite → tracking → map.
pub struct SharedState {
    pub map: RwLock<KeyframeMap>,
    pub landmarks: RwLock<LandmarkStore>,
    pub tracking: TrackingLink,
    /// Committed loop corrections; written by the relocation engine, read by
    /// the refiner's window builder.
    pub submaps: Mutex<SubmapLedger>,
    /// Everything at or before this timestamp has a finalized initial pose.
    backend_head: Mutex<Option<Timestamp>>,
    /// Serializes bulk pose rewrites (refiner propagation, loop corrections).
    rewrite: Mutex<()>,
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Advance the backend head. The head is a monotonic publication from
    /// the upstream optimizer; regressions are ignored.
    pub fn publish_backend_head(&self, time: Timestamp) {
        let mut head = self.backend_head.lock();
        match *head {
            Some(current) if time < current => {
                warn!("backend head regression {time} < {current}; ignored");
            }
            _ => *head = Some(time),
        }
    }

    pub fn backend_head(&self) -> Option<Timestamp> {
        *self.backend_head.lock()
    }

    /// First stage of the global lock order (rewrite → tracking → map).
    pub fn rewrite_lock(&self) -> MutexGuard<'_, ()> {
        self.rewrite.lock()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            map: RwLock::new(KeyframeMap::new()),
            landmarks: RwLock::new(LandmarkStore::new()),
            tracking: TrackingLink::new(),
            submaps: Mutex::new(SubmapLedger::new()),
            backend_head: Mutex::new(None),
            rewrite: Mutex::new(()),
            shutdown_requested: AtomicBool::new(false),
        }
    }
}
