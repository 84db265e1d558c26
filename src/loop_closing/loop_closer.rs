//! LoopCloser - Main loop closing thread.
//!
//! This module implements the main loop closing thread that:
//! 1. Receives keyframes from LocalMapping through the intake queue
//! 2. Re-checks the active loop and merge hypotheses against each keyframe
//! 3. Detects new candidates using BoW and verifies them with Sim3
//! 4. Corrects the atlas once a hypothesis is confirmed (merges first)
//! 5. Launches Global BA in the background
//!
//! Every processed keyframe is indexed for place recognition afterwards.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::atlas::keyframe_db::PlaceRecognition;
use crate::atlas::map::{KeyFrameId, MapId};
use crate::atlas::Atlas;
use crate::geometry::CameraModel;
use crate::optimizer::{DenseOptimizer, MapOptimizer, OptimizerConfig};
use crate::system::{acquire_pause, LocalMappingControl, PauseConfig, PauseOutcome, SharedState, TrackingControl};
use crate::vocabulary::Vocabulary;

use super::corrector::{CorrectionKind, Corrector, CorrectorConfig};
use super::detector::{CandidateDetector, DetectorConfig, RankedCandidate};
use super::global_refinement::{RefinementLauncher, RefinementStats};
use super::lifecycle::{Lifecycle, ResetScope};
use super::queue::KeyframeQueue;
use super::verifier::{GeometricVerifier, Hypothesis, HypothesisStatus, RegionKind, VerifierConfig};

/// Configuration for the LoopCloser.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopClosingConfig {
    pub detector: DetectorConfig,
    pub verifier: VerifierConfig,
    pub corrector: CorrectorConfig,

    /// Pause handshake with local mapping.
    pub pause: PauseConfig,

    /// Solver settings used by [`LoopClosingConfig::dense_optimizer`].
    pub optimizer: OptimizerConfig,

    /// Whether to run Global BA after each correction.
    pub run_global_refinement: bool,

    /// Sleep between polls of an empty queue.
    pub idle_sleep_ms: u64,
}

impl Default for LoopClosingConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            verifier: VerifierConfig::default(),
            corrector: CorrectorConfig::default(),
            pause: PauseConfig::default(),
            optimizer: OptimizerConfig::default(),
            run_global_refinement: true,
            idle_sleep_ms: 5,
        }
    }
}

impl LoopClosingConfig {
    /// Parse a YAML document. Missing keys keep their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Failed to parse loop closing config")
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse loop closing config {}", path.display()))
    }

    /// The stock optimizer with this configuration's solver settings.
    pub fn dense_optimizer(&self, camera: CameraModel) -> Arc<dyn MapOptimizer> {
        Arc::new(DenseOptimizer::new(camera, self.optimizer.clone()))
    }
}

/// Statistics for the loop closer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopClosingStats {
    /// Number of keyframes processed.
    pub keyframes_processed: u64,

    /// Loop and merge candidates returned by place recognition.
    pub candidates_detected: u64,

    pub loops_confirmed: u64,
    pub merges_confirmed: u64,

    pub refinements: RefinementStats,
}

/// The LoopCloser thread handler.
pub struct LoopCloser {
    /// Shared state with other threads.
    shared: Arc<SharedState>,
    place_recognition: Arc<dyn PlaceRecognition>,
    vocabulary: Arc<dyn Vocabulary>,
    optimizer: Arc<dyn MapOptimizer>,

    /// Whether the sensor gives metric scale (stereo, RGB-D, inertial).
    fix_scale: bool,
    config: LoopClosingConfig,

    queue: Arc<KeyframeQueue>,
    lifecycle: Arc<Lifecycle>,
    refinement: Arc<RefinementLauncher>,
    stats: Arc<Mutex<LoopClosingStats>>,

    detector: CandidateDetector,
    verifier: GeometricVerifier,
    corrector: Corrector,

    local_mapper: Option<Arc<dyn LocalMappingControl>>,
    tracker: Option<Arc<dyn TrackingControl>>,

    loop_hypothesis: Option<Hypothesis>,
    merge_hypothesis: Option<Hypothesis>,

    /// Current keyframe of the last applied correction.
    last_loop_kf: Option<KeyFrameId>,
}

impl LoopCloser {
    /// Create a new LoopCloser.
    pub fn new(
        shared: Arc<SharedState>,
        place_recognition: Arc<dyn PlaceRecognition>,
        vocabulary: Arc<dyn Vocabulary>,
        optimizer: Arc<dyn MapOptimizer>,
        camera: CameraModel,
        fix_scale: bool,
        config: LoopClosingConfig,
    ) -> Self {
        let refinement = RefinementLauncher::new(Arc::clone(&shared), Arc::clone(&optimizer), config.pause.clone());

        Self {
            detector: CandidateDetector::new(config.detector.clone()),
            verifier: GeometricVerifier::new(config.verifier.clone(), camera, fix_scale),
            corrector: Corrector::new(config.corrector.clone(), camera, fix_scale),
            shared,
            place_recognition,
            vocabulary,
            optimizer,
            fix_scale,
            config,
            queue: Arc::new(KeyframeQueue::new()),
            lifecycle: Arc::new(Lifecycle::new()),
            refinement: Arc::new(refinement),
            stats: Arc::new(Mutex::new(LoopClosingStats::default())),
            local_mapper: None,
            tracker: None,
            loop_hypothesis: None,
            merge_hypothesis: None,
            last_loop_kf: None,
        }
    }

    pub fn set_local_mapper(&mut self, local_mapper: Arc<dyn LocalMappingControl>) {
        self.local_mapper = Some(local_mapper);
    }

    pub fn set_tracker(&mut self, tracker: Arc<dyn TrackingControl>) {
        self.tracker = Some(tracker);
    }

    /// Queue a keyframe produced by local mapping.
    pub fn insert_keyframe(&self, kf_id: KeyFrameId) {
        self.queue.insert(kf_id);
    }

    pub fn request_reset(&self) {
        self.lifecycle.request_reset();
    }

    pub fn request_reset_for_map(&self, map_id: MapId) {
        self.lifecycle.request_reset_for_map(map_id);
    }

    pub fn reset_pending(&self) -> bool {
        self.lifecycle.reset_pending()
    }

    pub fn request_finish(&self) {
        self.lifecycle.request_finish();
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.is_finished()
    }

    pub fn is_running_global_refinement(&self) -> bool {
        self.refinement.is_running()
    }

    pub fn is_finished_global_refinement(&self) -> bool {
        self.refinement.is_finished()
    }

    pub fn last_loop_kf(&self) -> Option<KeyFrameId> {
        self.last_loop_kf
    }

    /// Get current statistics.
    pub fn stats(&self) -> LoopClosingStats {
        snapshot(&self.stats, &self.refinement)
    }

    /// Handle a pending reset, then process the oldest queued keyframe.
    ///
    /// Returns false when the queue was empty.
    pub fn step(&mut self) -> bool {
        self.process_reset();

        let Some(kf_id) = self.queue.take_next() else {
            return false;
        };
        self.process_keyframe(kf_id);
        true
    }

    /// Run the main loop closing thread until a finish is requested.
    pub fn run(mut self) {
        tracing::info!("LoopCloser thread started");
        let idle = Duration::from_millis(self.config.idle_sleep_ms.max(1));

        loop {
            let worked = self.step();
            if self.lifecycle.finish_requested() {
                break;
            }
            if !worked {
                thread::sleep(idle);
            }
        }

        // A refinement could wait forever on a local mapping that has
        // already stopped.
        self.refinement.abort();
        self.lifecycle.set_finished();

        let stats = self.stats();
        tracing::info!(
            "LoopCloser thread exiting. Stats: processed={}, candidates={}, loops={}, merges={}, refinements={}/{}",
            stats.keyframes_processed,
            stats.candidates_detected,
            stats.loops_confirmed,
            stats.merges_confirmed,
            stats.refinements.applied,
            stats.refinements.launched
        );
    }

    /// Move the loop closer onto its own thread.
    pub fn spawn(self) -> Result<LoopClosingHandle> {
        let queue = Arc::clone(&self.queue);
        let lifecycle = Arc::clone(&self.lifecycle);
        let refinement = Arc::clone(&self.refinement);
        let stats = Arc::clone(&self.stats);

        let thread = thread::Builder::new()
            .name("loop-closing".into())
            .spawn(move || self.run())
            .context("Failed to spawn the loop closing thread")?;

        Ok(LoopClosingHandle {
            queue,
            lifecycle,
            refinement,
            stats,
            thread: Some(thread),
        })
    }

    fn process_reset(&mut self) {
        let Some(scope) = self.lifecycle.take_reset() else {
            return;
        };

        match &scope {
            ResetScope::All => {
                self.queue.clear();
                self.detector.reset();
                self.loop_hypothesis = None;
                self.merge_hypothesis = None;
                self.last_loop_kf = None;
                info!("loop closing reset");
            }
            ResetScope::Maps(maps) => {
                let shared = Arc::clone(&self.shared);
                let atlas = shared.atlas.read();
                // Keyframes already gone from the atlas went with their map.
                let in_scope = |kf_id: KeyFrameId| atlas.map_of(kf_id).map_or(true, |map| scope.covers(map));

                let dropped = self.queue.retain(|kf_id| !in_scope(kf_id));
                self.detector.retain_members(&|kf_id| !in_scope(kf_id));
                for slot in [&mut self.loop_hypothesis, &mut self.merge_hypothesis] {
                    if slot
                        .as_ref()
                        .map_or(false, |h| scope.covers(h.matched_map) || in_scope(h.last_current_kf))
                    {
                        *slot = None;
                    }
                }
                if self.last_loop_kf.map_or(false, |kf_id| in_scope(kf_id)) {
                    self.last_loop_kf = None;
                }
                info!(?maps, dropped, "loop closing reset for maps");
            }
        }
    }

    /// Process a single keyframe for loop and merge detection.
    fn process_keyframe(&mut self, kf_id: KeyFrameId) {
        self.stats.lock().keyframes_processed += 1;
        self.quantize_keyframe(kf_id);

        let confirmed = {
            let shared = Arc::clone(&self.shared);
            let atlas = shared.atlas.read();
            if atlas.keyframe(kf_id).map_or(true, |kf| kf.is_bad) {
                debug!(kf = %kf_id, "keyframe no longer in the atlas");
                return;
            }
            self.detect_common_regions(&atlas, kf_id)
        };

        if let Some((kind, hypothesis)) = confirmed {
            self.close(kind, hypothesis);
        }

        self.index_keyframe(kf_id);
    }

    /// Advance the active hypotheses, look for new ones, and return the one
    /// to correct. Merges win over loops.
    ///
    /// An empty slot takes the first candidate that verifies. A pending one
    /// is only replaced by a promoted candidate that beats it.
    fn detect_common_regions(&mut self, atlas: &Atlas, kf_id: KeyFrameId) -> Option<(CorrectionKind, Hypothesis)> {
        let mut merge_confirmed = advance_slot(&self.verifier, atlas, kf_id, &mut self.merge_hypothesis);
        let mut loop_confirmed = advance_slot(&self.verifier, atlas, kf_id, &mut self.loop_hypothesis);

        if !merge_confirmed && !loop_confirmed {
            let detection = self.detector.detect(
                kf_id,
                atlas,
                self.place_recognition.as_ref(),
                self.vocabulary.as_ref(),
            );
            self.stats.lock().candidates_detected +=
                (detection.loop_candidates.len() + detection.merge_candidates.len()) as u64;

            merge_confirmed = fill_slot(
                &self.verifier,
                atlas,
                kf_id,
                &detection.merge_candidates,
                RegionKind::Merge,
                &mut self.merge_hypothesis,
            );
            if !merge_confirmed {
                loop_confirmed = fill_slot(
                    &self.verifier,
                    atlas,
                    kf_id,
                    &detection.loop_candidates,
                    RegionKind::Loop,
                    &mut self.loop_hypothesis,
                );
            }
        }

        if merge_confirmed {
            let kind = CorrectionKind::Merge {
                scale_reliable: self.fix_scale,
            };
            return self.merge_hypothesis.take().map(|h| (kind, h));
        }
        if loop_confirmed {
            return self.loop_hypothesis.take().map(|h| (CorrectionKind::Loop, h));
        }
        None
    }

    /// Apply a confirmed hypothesis with local mapping paused.
    fn close(&mut self, kind: CorrectionKind, hypothesis: Hypothesis) {
        info!(
            kf = %hypothesis.last_current_kf,
            matched = %hypothesis.matched_kf,
            ?kind,
            coincidences = hypothesis.coincidences,
            "common region confirmed"
        );

        // Before pausing: the refinement's apply phase pauses and resumes
        // local mapping on its own.
        let was_refining = self.refinement.is_running();
        self.refinement.abort();

        let lifecycle = Arc::clone(&self.lifecycle);
        let should_stop = move || lifecycle.finish_requested();

        let local_mapper = self.local_mapper.clone();
        if let Some(control) = local_mapper.as_deref() {
            if acquire_pause(control, &self.config.pause, &should_stop) == PauseOutcome::Abandoned {
                warn!(kf = %hypothesis.last_current_kf, "local mapping never paused, correction dropped");
                return;
            }
        }
        let tracker = match kind {
            CorrectionKind::Merge { .. } => self.tracker.clone(),
            CorrectionKind::Loop => None,
        };
        if let Some(tracker) = tracker.as_deref() {
            tracker.pause();
        }

        let report = {
            let mut atlas = self.shared.atlas.write();
            self.corrector
                .correct(&mut atlas, &hypothesis, kind, self.optimizer.as_ref(), &should_stop)
        };
        if let Some(report) = &report {
            if let Some(absorbed) = report.absorbed_map {
                self.place_recognition.move_map(absorbed, report.map_id);
            }
        }

        if let Some(tracker) = tracker.as_deref() {
            tracker.resume();
        }
        if let Some(control) = local_mapper.as_deref() {
            control.resume();
        }

        // Whatever else was pending refers to the geometry before this
        // correction.
        self.loop_hypothesis = None;
        self.merge_hypothesis = None;
        self.detector.reset();

        let Some(report) = report else {
            warn!(kf = %hypothesis.last_current_kf, ?kind, "correction could not be applied");
            // The map is as it was, so the aborted refinement is still owed.
            if was_refining && self.config.run_global_refinement {
                self.refinement.launch(hypothesis.last_current_kf, self.local_mapper.clone());
            }
            return;
        };

        {
            let mut stats = self.stats.lock();
            match report.kind {
                CorrectionKind::Loop => stats.loops_confirmed += 1,
                CorrectionKind::Merge { .. } => stats.merges_confirmed += 1,
            }
        }
        self.last_loop_kf = Some(report.current_kf);

        if self.config.run_global_refinement {
            self.refinement.launch(report.current_kf, self.local_mapper.clone());
        }
    }

    /// Compute BoW and feature vectors for a keyframe that arrived without.
    fn quantize_keyframe(&self, kf_id: KeyFrameId) {
        let descriptors = match self.shared.atlas.read().keyframe(kf_id) {
            Some(kf) if kf.bow_vector().is_none() => kf.descriptors.clone(),
            _ => return,
        };
        let Some((bow, features)) = self.vocabulary.quantize(&descriptors) else {
            return;
        };

        let mut atlas = self.shared.atlas.write();
        if let Some(kf) = atlas.keyframe_mut(kf_id) {
            debug!(kf = %kf_id, words = bow.len(), "keyframe quantised");
            kf.set_bow_vector(bow);
            kf.set_feature_vector(features);
        }
    }

    fn index_keyframe(&self, kf_id: KeyFrameId) {
        let atlas = self.shared.atlas.read();
        let (Some(map_id), Some(kf)) = (atlas.map_of(kf_id), atlas.keyframe(kf_id)) else {
            return;
        };
        if let Some(bow) = kf.bow_vector() {
            self.place_recognition.add(kf_id, map_id, bow);
        }
    }
}

/// Re-verify the hypothesis in `slot`, if any. Returns true once confirmed;
/// an abandoned hypothesis is removed.
fn advance_slot(
    verifier: &GeometricVerifier,
    atlas: &Atlas,
    kf_id: KeyFrameId,
    slot: &mut Option<Hypothesis>,
) -> bool {
    let Some(hypothesis) = slot.as_mut() else {
        return false;
    };
    match verifier.advance(atlas, kf_id, hypothesis) {
        HypothesisStatus::Confirmed => true,
        HypothesisStatus::Pending => false,
        HypothesisStatus::Abandoned => {
            debug!(kf = %kf_id, kind = ?hypothesis.kind, matched = %hypothesis.matched_kf, "hypothesis abandoned");
            *slot = None;
            false
        }
    }
}

/// Verify `candidates` for one slot. Returns whether the slot now holds a
/// confirmed hypothesis.
fn fill_slot(
    verifier: &GeometricVerifier,
    atlas: &Atlas,
    kf_id: KeyFrameId,
    candidates: &[RankedCandidate],
    kind: RegionKind,
    slot: &mut Option<Hypothesis>,
) -> bool {
    let promoted: Vec<RankedCandidate>;
    let candidates = if slot.is_some() {
        promoted = candidates.iter().filter(|c| c.promoted).cloned().collect();
        promoted.as_slice()
    } else {
        candidates
    };
    if candidates.is_empty() {
        return false;
    }
    let Some(fresh) = verifier.verify_candidates(atlas, kf_id, candidates, kind) else {
        return false;
    };

    if let Some(pending) = slot.as_ref() {
        if !supersedes(&fresh, pending) {
            return false;
        }
        debug!(
            kf = %kf_id,
            ?kind,
            old = %pending.matched_kf,
            new = %fresh.matched_kf,
            "pending hypothesis superseded"
        );
    }
    let confirmed = verifier.status(&fresh) == HypothesisStatus::Confirmed;
    *slot = Some(fresh);
    confirmed
}

/// More coincidences win; on a tie, more matched points.
fn supersedes(fresh: &Hypothesis, pending: &Hypothesis) -> bool {
    (fresh.coincidences, fresh.matches.len()) > (pending.coincidences, pending.matches.len())
}

fn snapshot(stats: &Mutex<LoopClosingStats>, refinement: &RefinementLauncher) -> LoopClosingStats {
    let mut stats = *stats.lock();
    stats.refinements = refinement.stats();
    stats
}

/// Handle to a spawned loop closing thread.
pub struct LoopClosingHandle {
    queue: Arc<KeyframeQueue>,
    lifecycle: Arc<Lifecycle>,
    refinement: Arc<RefinementLauncher>,
    stats: Arc<Mutex<LoopClosingStats>>,
    thread: Option<JoinHandle<()>>,
}

impl LoopClosingHandle {
    pub fn insert_keyframe(&self, kf_id: KeyFrameId) {
        self.queue.insert(kf_id);
    }

    pub fn request_reset(&self) {
        self.lifecycle.request_reset();
    }

    pub fn request_reset_for_map(&self, map_id: MapId) {
        self.lifecycle.request_reset_for_map(map_id);
    }

    pub fn reset_pending(&self) -> bool {
        self.lifecycle.reset_pending()
    }

    pub fn request_finish(&self) {
        self.lifecycle.request_finish();
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.is_finished()
    }

    pub fn is_running_global_refinement(&self) -> bool {
        self.refinement.is_running()
    }

    pub fn is_finished_global_refinement(&self) -> bool {
        self.refinement.is_finished()
    }

    pub fn stats(&self) -> LoopClosingStats {
        snapshot(&self.stats, &self.refinement)
    }

    /// Wait for the thread to exit. Call after [`Self::request_finish`].
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("loop closing thread panicked");
            }
        }
    }
}

impl Drop for LoopClosingHandle {
    fn drop(&mut self) {
        self.request_finish();
        self.join();
    }
}
