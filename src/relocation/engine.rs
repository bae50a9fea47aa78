//! Loop-closure engine background thread.
//!
//! For every keyframe that becomes safe behind the backend head:
//! 1. Computes appearance descriptors and indexes them into the place
//!    database (attaching them to the keyframe's keypoints)
//! 2. Detects a geometric revisit candidate (shape-checked nearest)
//! 3. Accumulates consecutive detections into a pending episode
//! 4. On the first miss after a streak, verifies the episode's end anchor,
//!    commits both loop constraints, and rewrites the affected history
//!
//! Verification failures discard the episode without touching the map.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::tick;
use tracing::{debug, info};

use crate::geometry::{CameraModel, SE3};
use crate::map::{LoopConstraint, Timestamp};
use crate::mapping::MapRefiner;
use crate::optimizer::SolverConfig;
use crate::relocation::brief::BriefExtractor;
use crate::relocation::corrector::correct_loop;
use crate::relocation::database::PlaceDatabase;
use crate::relocation::detector::{detect_candidate, LoopCandidate, LoopDetectorConfig};
use crate::relocation::verifier::{verify_loop, VerifyConfig};
use crate::system::propagation::Propagator;
use crate::system::shared_state::SharedState;

#[derive(Debug, Clone)]
pub struct RelocationConfig {
    /// Tick cadence of the engine loop.
    pub cycle: Duration,
    pub detector: LoopDetectorConfig,
    pub verify: VerifyConfig,
    /// Iteration budget per correction pass.
    pub solver: SolverConfig,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            cycle: Duration::from_millis(100),
            detector: LoopDetectorConfig::default(),
            verify: VerifyConfig::default(),
            solver: SolverConfig {
                max_iterations: 5,
                ..SolverConfig::default()
            },
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RelocationStats {
    pub keyframes_processed: u64,
    pub keyframes_indexed: u64,
    pub candidates: u64,
    pub episodes_discarded: u64,
    pub corrections: u64,
}

/// A pending revisit: consecutive candidate detections between the first
/// hit and the first miss. The start anchor is verified when the episode
/// opens and held here; the map is only written at commit.
#[derive(Debug)]
struct LoopEpisode {
    start_time: Timestamp,
    start_matched: Timestamp,
    start_relative: SE3,
    start_score: f64,
    end_time: Timestamp,
    end_matched: Timestamp,
    /// Oldest historical time matched by any member; the correction window
    /// reaches back to it.
    oldest_matched: Timestamp,
}

pub struct RelocationEngine {
    shared: Arc<SharedState>,
    refiner: Arc<MapRefiner>,
    propagator: Propagator,
    camera: Option<CameraModel>,
    config: RelocationConfig,
    brief: BriefExtractor,
    database: PlaceDatabase,
    /// Newest keyframe already processed.
    head: Option<Timestamp>,
    episode: Option<LoopEpisode>,
    stats: RelocationStats,
}

impl RelocationEngine {
    pub fn new(
        shared: Arc<SharedState>,
        refiner: Arc<MapRefiner>,
        camera: Option<CameraModel>,
        config: RelocationConfig,
    ) -> Self {
        let propagator = Propagator::new(shared.clone());
        Self {
            shared,
            refiner,
            propagator,
            camera,
            config,
            brief: BriefExtractor::new(),
            database: PlaceDatabase::new(),
            head: None,
            episode: None,
            stats: RelocationStats::default(),
        }
    }

    /// Main thread loop. Returns once shutdown is requested.
    pub fn run(&mut self) {
        info!("[Relocation] thread started");
        let ticker = tick(self.config.cycle);
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }
            if ticker.recv().is_err() {
                break;
            }
            self.cycle();
        }
        info!(
            "[Relocation] thread exiting after {} keyframes, {} corrections",
            self.stats.keyframes_processed, self.stats.corrections
        );
    }

    /// One polling cycle: process every keyframe that became safe since
    /// the last cycle.
    pub fn cycle(&mut self) {
        let Some(backend_head) = self.shared.backend_head() else {
            return;
        };
        let times: Vec<Timestamp> = {
            let map = self.shared.map.read();
            match self.head {
                Some(after) => map.window(after, backend_head).map(|kf| kf.time).collect(),
                None => map
                    .iter()
                    .take_while(|kf| kf.time <= backend_head)
                    .map(|kf| kf.time)
                    .collect(),
            }
        };
        for time in times {
            self.process_keyframe(time);
            self.head = Some(time);
        }
    }

    pub fn head(&self) -> Option<Timestamp> {
        self.head
    }

    pub fn stats(&self) -> &RelocationStats {
        &self.stats
    }

    fn process_keyframe(&mut self, time: Timestamp) {
        self.stats.keyframes_processed += 1;
        self.index_keyframe(time);

        let candidate = {
            let map = self.shared.map.read();
            map.get(time)
                .and_then(|frame| detect_candidate(&map, frame, &self.config.detector))
        };
        match candidate {
            Some(candidate) => {
                self.stats.candidates += 1;
                if let Some(episode) = self.episode.as_mut() {
                    episode.end_time = time;
                    episode.end_matched = candidate.matched_time;
                    episode.oldest_matched = episode.oldest_matched.min(candidate.matched_time);
                } else {
                    self.try_open_episode(time, candidate);
                }
            }
            None => {
                if let Some(episode) = self.episode.take() {
                    self.finalize_episode(episode);
                }
            }
        }
    }

    /// Attach appearance descriptors to the keyframe's keypoints and index
    /// them. Keyframes without imagery are skipped.
    fn index_keyframe(&mut self, time: Timestamp) {
        let collected = {
            let map = self.shared.map.read();
            map.get(time).and_then(|kf| {
                let visual = kf.visual.as_ref()?;
                let image = visual.image.clone()?;
                let pixels: Vec<_> = visual.keypoints.iter().map(|kp| kp.pixel).collect();
                Some((image, pixels))
            })
        };
        let Some((image, pixels)) = collected else {
            return;
        };
        let described = self.brief.extract(&image, &pixels);
        if described.is_empty() {
            return;
        }

        // The extractor may return fewer rows than keypoints went in; match
        // rows back by pixel instead of assuming positional correspondence.
        // Keypoints without a computed descriptor stay bare.
        {
            let mut map = self.shared.map.write();
            if let Some(visual) = map.get_mut(time).and_then(|kf| kf.visual.as_mut()) {
                let mut rows = described.iter();
                let mut row = rows.next();
                for keypoint in visual.keypoints.iter_mut() {
                    if let Some((pixel, descriptor)) = row {
                        if *pixel == keypoint.pixel {
                            keypoint.descriptor = Some(*descriptor);
                            row = rows.next();
                        }
                    }
                }
            }
        }

        let descriptors = described.into_iter().map(|(_, d)| d).collect();
        let entry = self.database.insert(time, descriptors);
        self.stats.keyframes_indexed += 1;
        debug!("indexed keyframe {time} as {entry}");
    }

    /// Verify the candidate at the streak gate; only confirmed geometry
    /// opens an episode.
    fn try_open_episode(&mut self, time: Timestamp, candidate: LoopCandidate) {
        let relative = {
            let map = self.shared.map.read();
            let landmarks = self.shared.landmarks.read();
            verify_loop(
                &map,
                &landmarks,
                self.camera.as_ref(),
                time,
                candidate.matched_time,
                &self.config.verify,
            )
        };
        let Some(relative) = relative else {
            return;
        };
        let score = self.appearance_score(time, candidate.matched_time);
        info!(
            "[Relocation] episode opened at {time} against {} (distance {:.2})",
            candidate.matched_time, candidate.distance
        );
        self.episode = Some(LoopEpisode {
            start_time: time,
            start_matched: candidate.matched_time,
            start_relative: relative,
            start_score: score,
            end_time: time,
            end_matched: candidate.matched_time,
            oldest_matched: candidate.matched_time,
        });
    }

    fn appearance_score(&self, time: Timestamp, matched: Timestamp) -> f64 {
        match self.database.descriptors_at(time) {
            Some(descriptors) => self.database.appearance_score(descriptors, matched),
            None => 0.0,
        }
    }

    /// Verify the episode's end anchor, commit both constraints together,
    /// and rewrite the affected history.
    fn finalize_episode(&mut self, episode: LoopEpisode) {
        let end_anchor = if episode.end_time == episode.start_time {
            Some((
                episode.start_matched,
                episode.start_relative,
                episode.start_score,
            ))
        } else {
            let relative = {
                let map = self.shared.map.read();
                let landmarks = self.shared.landmarks.read();
                verify_loop(
                    &map,
                    &landmarks,
                    self.camera.as_ref(),
                    episode.end_time,
                    episode.end_matched,
                    &self.config.verify,
                )
            };
            relative.map(|rel| {
                let score = self.appearance_score(episode.end_time, episode.end_matched);
                (episode.end_matched, rel, score)
            })
        };
        let Some((end_matched, end_relative, end_score)) = end_anchor else {
            info!(
                "[Relocation] episode [{}, {}] failed end verification; discarded",
                episode.start_time, episode.end_time
            );
            self.stats.episodes_discarded += 1;
            return;
        };

        // Both anchors commit together; nothing was written before this.
        {
            let mut map = self.shared.map.write();
            if let Some(kf) = map.get_mut(episode.start_time) {
                kf.loop_constraint = Some(LoopConstraint {
                    matched_time: episode.start_matched,
                    relative_pose: episode.start_relative,
                    score: episode.start_score,
                });
            }
            if episode.end_time != episode.start_time {
                if let Some(kf) = map.get_mut(episode.end_time) {
                    kf.loop_constraint = Some(LoopConstraint {
                        matched_time: end_matched,
                        relative_pose: end_relative,
                        score: end_score,
                    });
                }
            }
        }
        info!(
            "[Relocation] loop verified: [{}, {}] against {}",
            episode.start_time, episode.end_time, episode.oldest_matched
        );

        correct_loop(
            &self.shared,
            &self.refiner,
            &self.propagator,
            episode.oldest_matched,
            episode.start_time,
            episode.end_time,
            &self.config.solver,
        );
        self.stats.corrections += 1;
    }
}
