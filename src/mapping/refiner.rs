//! Map refiner background thread.
//!
//! Walks the keyframe map behind the backend head on a fixed cadence:
//! 1. Collects the unrefined window under the map read lock
//! 2. Builds the scan-alignment problem and solves it (bounded passes)
//! 3. Writes poses back and propagates the end-of-window delta downstream
//! 4. Re-renders the window's world-frame point buckets
//!
//! The relocation engine parks this thread through the pause gate before
//! committing a loop correction, and hands a span back through
//! [`MapRefiner::optimize_span`] afterwards.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::tick;
use image::GrayImage;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::cloud::ColoredPoint;
use crate::geometry::{CameraModel, SE3};
use crate::map::{ScanFeatures, Timestamp};
use crate::mapping::world_map::{render_scan, WorldMap};
use crate::optimizer::{build_scan_window, solve_pose_graph, ScanWindowConfig, SolverConfig};
use crate::system::propagation::Propagator;
use crate::system::shared_state::SharedState;

/// Where the refiner thread is in its pause protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinerStatus {
    /// Refining windows on the tick cadence.
    Running,
    /// A pause was requested; the refiner finishes its current cycle.
    ToPause,
    /// Parked between cycles; the map is safe to rewrite.
    Pausing,
    /// The thread has exited; pause requests fail.
    Exited,
}

/// Condvar-backed handshake between the refiner thread and a pauser.
///
/// The refiner calls [`PauseGate::checkpoint`] between cycles while holding
/// no other locks, so a parked refiner can never participate in a deadlock.
struct PauseGate {
    state: Mutex<RefinerStatus>,
    condvar: Condvar,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(RefinerStatus::Running),
            condvar: Condvar::new(),
        }
    }

    /// Block until the refiner is parked. Returns false if the refiner
    /// thread has already exited.
    fn request_pause(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            match *state {
                RefinerStatus::Pausing => return true,
                RefinerStatus::Exited => return false,
                RefinerStatus::Running => {
                    *state = RefinerStatus::ToPause;
                }
                RefinerStatus::ToPause => {}
            }
            self.condvar.wait(&mut state);
        }
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        if matches!(*state, RefinerStatus::Pausing | RefinerStatus::ToPause) {
            *state = RefinerStatus::Running;
            self.condvar.notify_all();
        }
    }

    /// Called by the refiner between cycles; parks until resumed.
    fn checkpoint(&self) {
        let mut state = self.state.lock();
        if *state == RefinerStatus::ToPause {
            *state = RefinerStatus::Pausing;
            self.condvar.notify_all();
            while *state == RefinerStatus::Pausing {
                self.condvar.wait(&mut state);
            }
        }
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        *state = RefinerStatus::Exited;
        self.condvar.notify_all();
    }

    fn status(&self) -> RefinerStatus {
        *self.state.lock()
    }
}

/// Configuration for the refiner thread.
#[derive(Debug, Clone)]
pub struct RefinerConfig {
    /// Tick cadence of the refinement loop.
    pub cycle: Duration,
    /// Solver invocations per window.
    pub passes: usize,
    /// Iteration cap per solver invocation.
    pub iterations_per_pass: usize,
    pub window: ScanWindowConfig,
    /// Leaf size of the global-map voxel grid.
    pub voxel_leaf: f64,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            cycle: Duration::from_millis(100),
            passes: 2,
            iterations_per_pass: 1,
            window: ScanWindowConfig::default(),
            voxel_leaf: 0.4,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RefinerStats {
    pub cycles: u64,
    pub windows: u64,
    pub keyframes_refined: u64,
    pub pauses: u64,
}

/// Background consumer that incrementally refines keyframe poses behind the
/// backend head and maintains the rendered world map.
pub struct MapRefiner {
    shared: Arc<SharedState>,
    propagator: Propagator,
    camera: Option<CameraModel>,
    config: RefinerConfig,
    /// Newest keyframe already refined; the next window starts after it.
    head: Mutex<Option<Timestamp>>,
    gate: PauseGate,
    world: Mutex<WorldMap>,
    stats: Mutex<RefinerStats>,
}

impl MapRefiner {
    pub fn new(
        shared: Arc<SharedState>,
        camera: Option<CameraModel>,
        config: RefinerConfig,
    ) -> Arc<Self> {
        let propagator = Propagator::new(shared.clone());
        Arc::new(Self {
            shared,
            propagator,
            camera,
            config,
            head: Mutex::new(None),
            gate: PauseGate::new(),
            world: Mutex::new(WorldMap::new()),
            stats: Mutex::new(RefinerStats::default()),
        })
    }

    /// Main thread loop. Returns once shutdown is requested.
    pub fn run(&self) {
        info!("[MapRefiner] thread started");
        let ticker = tick(self.config.cycle);
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }
            if ticker.recv().is_err() {
                break;
            }
            self.gate.checkpoint();
            if self.shared.is_shutdown_requested() {
                break;
            }
            self.cycle();
        }
        self.gate.exit();
        let stats = self.stats.lock().clone();
        info!(
            "[MapRefiner] thread exiting after {} cycles, {} windows refined, {} pauses",
            stats.cycles, stats.windows, stats.pauses
        );
    }

    /// One refinement cycle: refine the window after the head, then advance
    /// the head. Does nothing when no new keyframes sit behind the backend
    /// head.
    pub fn cycle(&self) {
        self.stats.lock().cycles += 1;
        let Some(backend_head) = self.shared.backend_head() else {
            return;
        };
        let head = *self.head.lock();
        let window: Vec<Timestamp> = {
            let map = self.shared.map.read();
            match head {
                Some(after) => map.window(after, backend_head).map(|kf| kf.time).collect(),
                None => map
                    .iter()
                    .take_while(|kf| kf.time <= backend_head)
                    .map(|kf| kf.time)
                    .collect(),
            }
        };
        let (Some(&start), Some(&end)) = (window.first(), window.last()) else {
            return;
        };
        self.refine(start, end);
        *self.head.lock() = Some(end);
    }

    /// Synchronously re-refine `[start, end]` without moving the head. The
    /// relocation engine hands corrected spans back through this after a
    /// loop commit.
    pub fn optimize_span(&self, start: Timestamp, end: Timestamp) {
        self.refine(start, end);
    }

    fn refine(&self, start: Timestamp, end: Timestamp) {
        let spans = self.shared.submaps.lock().committed_spans();
        let mut problem = {
            let map = self.shared.map.read();
            build_scan_window(&map, start, end, &spans, &self.config.window)
        };
        if problem.num_free() > 0 && problem.num_terms() > 0 {
            let solver = SolverConfig {
                max_iterations: self.config.iterations_per_pass,
                ..SolverConfig::default()
            };
            let should_stop = || self.shared.is_shutdown_requested();
            for _ in 0..self.config.passes {
                solve_pose_graph(&mut problem, &solver, &should_stop);
            }
            let report = self
                .propagator
                .apply_and_propagate(&problem.solution(), end);
            debug!(
                "[MapRefiner] refined [{start}, {end}]: {} written, {} propagated",
                report.window_written, report.propagated
            );
            let mut stats = self.stats.lock();
            stats.windows += 1;
            stats.keyframes_refined += problem.num_free() as u64;
        }
        self.render(start, end);
    }

    /// Re-render the world-frame buckets of every scan keyframe in
    /// `[start, end]` from its current pose.
    fn render(&self, start: Timestamp, end: Timestamp) {
        let frames: Vec<(Timestamp, SE3, ScanFeatures, Option<Arc<GrayImage>>)> = {
            let map = self.shared.map.read();
            map.range(start, None)
                .take_while(|kf| kf.time <= end)
                .filter_map(|kf| {
                    let scan = kf.scan.as_ref()?.clone();
                    let image = kf.visual.as_ref().and_then(|v| v.image.clone());
                    Some((kf.time, kf.pose, scan, image))
                })
                .collect()
        };
        if frames.is_empty() {
            return;
        }
        let mut buckets = Vec::with_capacity(frames.len());
        for (time, pose, scan, image) in &frames {
            let points = render_scan(pose, scan, image.as_deref(), self.camera.as_ref());
            buckets.push((*time, points));
        }
        let mut world = self.world.lock();
        for (time, points) in buckets {
            world.insert_bucket(time, points);
        }
    }

    /// Park the refiner between cycles. Blocks until it acknowledges;
    /// returns false if the thread has exited (the caller must then skip
    /// its rewrite).
    pub fn pause(&self) -> bool {
        let parked = self.gate.request_pause();
        if parked {
            self.stats.lock().pauses += 1;
        }
        parked
    }

    /// Release a parked refiner.
    pub fn resume(&self) {
        self.gate.resume();
    }

    pub fn status(&self) -> RefinerStatus {
        self.gate.status()
    }

    pub fn head(&self) -> Option<Timestamp> {
        *self.head.lock()
    }

    /// Snapshot of the assembled global map, voxel-downsampled.
    pub fn global_map(&self) -> Vec<ColoredPoint> {
        self.world.lock().global_cloud(self.config.voxel_leaf)
    }

    pub fn stats(&self) -> RefinerStats {
        self.stats.lock().clone()
    }
}
