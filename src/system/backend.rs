//! Backend orchestration: owns the shared state and the two background
//! consumers (map refiner, relocation engine).
//!
//! The front end keeps inserting keyframes and publishing the backend head
//! from its own thread; this struct only manages the consumers' lifecycle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::info;

use crate::cloud::ColoredPoint;
use crate::geometry::CameraModel;
use crate::mapping::{MapRefiner, RefinerConfig};
use crate::relocation::{RelocationConfig, RelocationEngine};

use super::shared_state::SharedState;

#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub refiner: RefinerConfig,
    pub relocation: RelocationConfig,
}

/// Owns and supervises the background mapping threads.
pub struct SlamBackend {
    /// Shared state (keyframe map, cursors, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// Kept for pause coordination and global-map queries.
    refiner: Arc<MapRefiner>,

    /// Handle to the refiner thread.
    refiner_handle: Option<JoinHandle<()>>,

    /// Handle to the relocation engine thread.
    relocation_handle: Option<JoinHandle<()>>,
}

impl SlamBackend {
    /// Create the shared state and spawn both consumer threads.
    pub fn new(camera: Option<CameraModel>, config: BackendConfig) -> Self {
        let shared = SharedState::new();
        let refiner = MapRefiner::new(shared.clone(), camera, config.refiner);

        let refiner_handle = Self::spawn_refiner(refiner.clone());
        let relocation_handle =
            Self::spawn_relocation(shared.clone(), refiner.clone(), camera, config.relocation);

        Self {
            shared,
            refiner,
            refiner_handle: Some(refiner_handle),
            relocation_handle: Some(relocation_handle),
        }
    }

    fn spawn_refiner(refiner: Arc<MapRefiner>) -> JoinHandle<()> {
        thread::spawn(move || refiner.run())
    }

    fn spawn_relocation(
        shared: Arc<SharedState>,
        refiner: Arc<MapRefiner>,
        camera: Option<CameraModel>,
        config: RelocationConfig,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut engine = RelocationEngine::new(shared, refiner, camera, config);
            engine.run();
        })
    }

    /// Shared state for the front end: map inserts, head publishing, and
    /// the live tracking link.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn refiner(&self) -> &Arc<MapRefiner> {
        &self.refiner
    }

    /// Downsampled world-frame point cloud accumulated so far.
    pub fn global_map(&self) -> Vec<ColoredPoint> {
        self.refiner.global_map()
    }

    /// Shutdown the backend gracefully.
    ///
    /// Signals both threads and waits for them. A refiner parked at its
    /// pause gate is woken first so it can observe the flag.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        self.refiner.resume();

        if let Some(handle) = self.relocation_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.refiner_handle.take() {
            let _ = handle.join();
        }
        info!("[Backend] shut down");
    }
}

impl Drop for SlamBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
