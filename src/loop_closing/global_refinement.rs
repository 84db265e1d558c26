//! Background global bundle adjustment after a correction.
//!
//! Same three phases as every BA in the crate, spread over two threads:
//! 1. COLLECT: snapshot the active map under a read lock (caller's thread)
//! 2. SOLVE: run the optimizer lock-free on a dedicated thread
//! 3. APPLY: write back under the write lock with local mapping paused
//!
//! Each launch takes a new generation. A result is only applied while its
//! generation is still current, no stop was requested and its map is still
//! the active one; anything else is dropped silently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::SE3;
use crate::optimizer::{apply_bundle_result, collect_global_problem, BundleProblem, BundleResult, MapOptimizer};
use crate::system::{acquire_pause, LocalMappingControl, PauseConfig, PauseOutcome, SharedState};

/// Counters over the launcher's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefinementStats {
    pub launched: u64,
    pub applied: u64,
    pub discarded: u64,
}

/// What [`RefinementLauncher::launch`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started { generation: u64 },
    /// A refinement is already running; nothing was started.
    AlreadyRunning,
    /// The active map has nothing to optimize.
    NothingToRefine,
    SpawnFailed,
}

#[derive(Debug, Default)]
struct Status {
    running: bool,
    finished: bool,
    generation: u64,
    stats: RefinementStats,
}

struct LauncherState {
    status: Mutex<Status>,
    stop: AtomicBool,
}

impl LauncherState {
    fn is_current(&self, generation: u64) -> bool {
        !self.stop.load(Ordering::SeqCst) && self.status.lock().generation == generation
    }
}

/// Owns the refinement thread and its generation token.
pub struct RefinementLauncher {
    shared: Arc<SharedState>,
    optimizer: Arc<dyn MapOptimizer>,
    pause: PauseConfig,
    state: Arc<LauncherState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefinementLauncher {
    pub fn new(shared: Arc<SharedState>, optimizer: Arc<dyn MapOptimizer>, pause: PauseConfig) -> Self {
        Self {
            shared,
            optimizer,
            pause,
            state: Arc::new(LauncherState {
                status: Mutex::new(Status::default()),
                stop: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start refining the active map after a correction at `trigger`.
    ///
    /// No-op while a previous refinement is still running. Concurrent calls
    /// race for a single slot, so at most one of them starts a thread.
    pub fn launch(
        &self,
        trigger: KeyFrameId,
        local_mapper: Option<Arc<dyn LocalMappingControl>>,
    ) -> LaunchOutcome {
        self.reap_finished();

        let generation = {
            let mut status = self.state.status.lock();
            if status.running {
                debug!(%trigger, "global refinement already running");
                return LaunchOutcome::AlreadyRunning;
            }
            status.running = true;
            status.finished = false;
            status.generation += 1;
            self.state.stop.store(false, Ordering::SeqCst);
            status.generation
        };

        // The previous thread has already left its run loop.
        let previous = self.handle.lock().take();
        if let Some(previous) = previous {
            let _ = previous.join();
        }

        // The status lock is never held while taking the atlas: the apply
        // phase takes them in the opposite order.
        let problem = {
            let atlas = self.shared.atlas.read();
            atlas.active_map().and_then(collect_global_problem)
        };
        let Some(problem) = problem else {
            debug!(%trigger, "nothing to refine");
            self.state.status.lock().running = false;
            return LaunchOutcome::NothingToRefine;
        };

        self.state.status.lock().stats.launched += 1;
        info!(
            %trigger,
            map = %problem.map_id,
            generation,
            keyframes = problem.poses.len(),
            points = problem.points.len(),
            "launching global refinement"
        );

        let task = RefinementTask {
            shared: Arc::clone(&self.shared),
            optimizer: Arc::clone(&self.optimizer),
            state: Arc::clone(&self.state),
            pause: self.pause.clone(),
            local_mapper,
            problem,
            generation,
        };
        let spawned = thread::Builder::new()
            .name("global-refinement".into())
            .spawn(move || task.run());

        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                LaunchOutcome::Started { generation }
            }
            Err(err) => {
                warn!(error = %err, "could not spawn the global refinement thread");
                let mut status = self.state.status.lock();
                status.running = false;
                status.stats.discarded += 1;
                LaunchOutcome::SpawnFailed
            }
        }
    }

    /// Join a refinement thread that has already exited.
    ///
    /// A thread that panicked never cleared `running`; this clears it.
    fn reap_finished(&self) {
        let finished = {
            let mut handle = self.handle.lock();
            match handle.as_ref() {
                Some(h) if h.is_finished() => handle.take(),
                _ => None,
            }
        };
        if let Some(handle) = finished {
            if handle.join().is_err() {
                warn!("global refinement thread panicked");
                let mut status = self.state.status.lock();
                status.running = false;
                status.finished = true;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.status.lock().running
    }

    /// Whether the last launched refinement has completed (applied or not).
    pub fn is_finished(&self) -> bool {
        self.state.status.lock().finished
    }

    pub fn stop_requested(&self) -> bool {
        self.state.stop.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.state.status.lock().generation
    }

    pub fn stats(&self) -> RefinementStats {
        self.state.status.lock().stats
    }

    /// Invalidate the running refinement and wait for its thread.
    pub fn abort(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
        let running = {
            let mut status = self.state.status.lock();
            status.generation += 1;
            status.running
        };
        if running {
            info!("aborting global refinement");
        }
        self.join();
    }

    /// Wait for the refinement thread, if any.
    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("global refinement thread panicked");
                self.state.status.lock().running = false;
            }
        }
    }
}

impl Drop for RefinementLauncher {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Everything the refinement thread owns.
struct RefinementTask {
    shared: Arc<SharedState>,
    optimizer: Arc<dyn MapOptimizer>,
    state: Arc<LauncherState>,
    pause: PauseConfig,
    local_mapper: Option<Arc<dyn LocalMappingControl>>,
    problem: BundleProblem,
    generation: u64,
}

impl RefinementTask {
    fn run(self) {
        let should_stop = || !self.state.is_current(self.generation);
        let result = self.optimizer.global_bundle_adjustment(&self.problem, &should_stop);

        let applied = match result {
            Some(result) if !should_stop() => self.apply(&result),
            Some(_) => {
                debug!(generation = self.generation, "global refinement superseded");
                false
            }
            None => {
                debug!(generation = self.generation, "global refinement produced no result");
                false
            }
        };

        let mut status = self.state.status.lock();
        status.running = false;
        status.finished = true;
        if applied {
            status.stats.applied += 1;
        } else {
            status.stats.discarded += 1;
        }
    }

    fn apply(&self, result: &BundleResult) -> bool {
        let should_abandon = || !self.state.is_current(self.generation);
        let control = self.local_mapper.as_deref();
        if let Some(control) = control {
            if acquire_pause(control, &self.pause, &should_abandon) == PauseOutcome::Abandoned {
                return false;
            }
        }

        let applied = {
            let mut atlas = self.shared.atlas.write();
            if should_abandon() {
                debug!(generation = self.generation, "global refinement superseded");
                false
            } else if atlas.active_map_id() != result.map_id {
                debug!(map = %result.map_id, "active map changed during global refinement");
                false
            } else if let Some(map) = atlas.get_map_mut(result.map_id) {
                let updated = apply_refinement(map, &self.problem, result);
                info!(
                    map = %result.map_id,
                    generation = self.generation,
                    iterations = result.iterations,
                    updated,
                    "global refinement applied, cost {:.4} -> {:.4}",
                    result.initial_cost,
                    result.final_cost
                );
                true
            } else {
                false
            }
        };

        if let Some(control) = control {
            control.resume();
        }
        applied
    }
}

/// Write a global BA result back and carry along what was created after the
/// snapshot.
///
/// Keyframes missing from the snapshot take the pose change of their
/// spanning tree parent; points missing from the result take the change of
/// their reference keyframe.
pub fn apply_refinement(map: &mut Map, problem: &BundleProblem, result: &BundleResult) -> usize {
    let before: HashMap<KeyFrameId, SE3> = map.keyframes().map(|kf| (kf.id, kf.pose)).collect();
    let mut updated = apply_bundle_result(map, result);

    let mut roots: Vec<KeyFrameId> = map
        .keyframes()
        .filter(|kf| kf.parent_id.map_or(true, |parent| !map.contains_keyframe(parent)))
        .map(|kf| kf.id)
        .collect();
    roots.sort();

    let mut visited: HashSet<KeyFrameId> = roots.iter().copied().collect();
    let mut queue: VecDeque<KeyFrameId> = roots.into();
    while let Some(parent) = queue.pop_front() {
        let Some(parent_kf) = map.get_keyframe(parent) else {
            continue;
        };
        let parent_new = parent_kf.pose;
        let mut children: Vec<KeyFrameId> = parent_kf.children_ids.iter().copied().collect();
        children.sort();

        for child in children {
            if !visited.insert(child) {
                continue;
            }
            queue.push_back(child);
            if problem.poses.contains_key(&child) {
                continue;
            }
            let (Some(parent_old), Some(child_old)) = (before.get(&parent), before.get(&child)) else {
                continue;
            };
            let pose = parent_new.compose(&parent_old.inverse()).compose(child_old);
            if let Some(kf) = map.get_keyframe_mut(child) {
                kf.pose = pose;
                updated += 1;
            }
        }
    }

    let late_points: Vec<(MapPointId, KeyFrameId)> = map
        .map_points()
        .filter(|mp| !mp.is_bad && !result.points.contains_key(&mp.id))
        .map(|mp| (mp.id, mp.first_kf_id))
        .collect();
    for (mp_id, reference) in late_points {
        let (Some(old), Some(kf)) = (before.get(&reference), map.get_keyframe(reference)) else {
            continue;
        };
        let delta = kf.pose.compose(&old.inverse());
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = delta.transform_point(&mp.position);
            updated += 1;
        }
        map.update_map_point_normal_and_depth(mp_id);
    }

    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    use approx::assert_relative_eq;
    use crossbeam_channel::{Receiver, Sender};
    use nalgebra::{UnitQuaternion, Vector3};

    use crate::atlas::map::{KeyFrame, MapId, MapPoint};
    use crate::test_support::{descriptor, gated_optimizer, kf, loop_scene, shift, GatedOptimizer, ObedientMapper};

    const WAIT: Duration = Duration::from_secs(10);

    struct Harness {
        shared: Arc<SharedState>,
        optimizer: Arc<GatedOptimizer>,
        launcher: RefinementLauncher,
        entered: Receiver<()>,
        release: Sender<()>,
    }

    fn harness() -> Harness {
        let scene = loop_scene();
        let shared = SharedState::with_atlas(scene.atlas);
        let (optimizer, entered, release) = gated_optimizer();
        let launcher = RefinementLauncher::new(
            Arc::clone(&shared),
            Arc::clone(&optimizer) as Arc<dyn MapOptimizer>,
            PauseConfig::default(),
        );
        Harness {
            shared,
            optimizer,
            launcher,
            entered,
            release,
        }
    }

    fn pose_of(shared: &SharedState, kf_id: KeyFrameId) -> SE3 {
        shared.atlas.read().keyframe(kf_id).map(|kf| kf.pose).unwrap()
    }

    fn origin(shared: &SharedState) -> KeyFrameId {
        shared.atlas.read().active_map().and_then(Map::origin_keyframe).unwrap()
    }

    #[test]
    fn test_second_launch_is_noop_and_result_is_applied() {
        let h = harness();
        let mapper = Arc::new(ObedientMapper::default());
        let anchor = origin(&h.shared);
        let anchor_before = pose_of(&h.shared, anchor);
        let before = pose_of(&h.shared, kf(30));

        let outcome = h.launcher.launch(kf(52), Some(mapper.clone() as Arc<dyn LocalMappingControl>));
        assert_eq!(outcome, LaunchOutcome::Started { generation: 1 });
        h.entered.recv_timeout(WAIT).unwrap();
        assert!(h.launcher.is_running());
        assert!(!h.launcher.is_finished());

        assert_eq!(h.launcher.launch(kf(52), None), LaunchOutcome::AlreadyRunning);

        h.release.send(()).unwrap();
        h.launcher.join();

        assert!(!h.launcher.is_running());
        assert!(h.launcher.is_finished());
        assert_eq!(h.optimizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.launcher.stats(),
            RefinementStats {
                launched: 1,
                applied: 1,
                discarded: 0
            }
        );
        assert_eq!(mapper.pause_requests.load(Ordering::SeqCst), 1);
        assert_eq!(mapper.resumes.load(Ordering::SeqCst), 1);

        let expected = shift().compose(&before);
        assert_relative_eq!(pose_of(&h.shared, kf(30)).translation, expected.translation, epsilon = 1e-9);
        // The gauge keyframe is not part of the result.
        assert_relative_eq!(pose_of(&h.shared, anchor).translation, anchor_before.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_concurrent_launches_start_one_refinement() {
        let h = harness();
        let launcher = Arc::new(h.launcher);
        let barrier = Arc::new(Barrier::new(2));

        let callers: Vec<_> = (0..2)
            .map(|_| {
                let launcher = Arc::clone(&launcher);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    launcher.launch(kf(52), None)
                })
            })
            .collect();
        let mut outcomes: Vec<LaunchOutcome> = callers.into_iter().map(|c| c.join().unwrap()).collect();
        outcomes.sort_by_key(|o| matches!(o, LaunchOutcome::AlreadyRunning));

        assert_eq!(outcomes, vec![LaunchOutcome::Started { generation: 1 }, LaunchOutcome::AlreadyRunning]);
        h.entered.recv_timeout(WAIT).unwrap();
        assert!(launcher.is_running());

        h.release.send(()).unwrap();
        launcher.join();

        assert_eq!(h.optimizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            launcher.stats(),
            RefinementStats {
                launched: 1,
                applied: 1,
                discarded: 0
            }
        );
    }

    #[test]
    fn test_abort_discards_running_result() {
        let h = harness();
        let before = pose_of(&h.shared, kf(30));

        assert!(matches!(h.launcher.launch(kf(52), None), LaunchOutcome::Started { .. }));
        h.entered.recv_timeout(WAIT).unwrap();

        h.launcher.abort();

        assert!(h.launcher.stop_requested());
        assert!(h.optimizer.stopped.load(Ordering::SeqCst));
        assert!(!h.launcher.is_running());
        assert_eq!(h.launcher.generation(), 2);
        assert_eq!(
            h.launcher.stats(),
            RefinementStats {
                launched: 1,
                applied: 0,
                discarded: 1
            }
        );
        assert_relative_eq!(pose_of(&h.shared, kf(30)).translation, before.translation, epsilon = 1e-12);

        // A later launch runs normally.
        assert_eq!(h.launcher.launch(kf(52), None), LaunchOutcome::Started { generation: 3 });
        assert!(!h.launcher.stop_requested());
        h.release.send(()).unwrap();
        h.launcher.join();
        assert_eq!(h.launcher.stats().applied, 1);
    }

    #[test]
    fn test_result_for_inactive_map_is_discarded() {
        let h = harness();
        let before = pose_of(&h.shared, kf(30));

        assert!(matches!(h.launcher.launch(kf(52), None), LaunchOutcome::Started { .. }));
        h.entered.recv_timeout(WAIT).unwrap();
        let fresh: MapId = h.shared.atlas.write().create_new_map();
        assert_eq!(h.shared.atlas.read().active_map_id(), fresh);

        h.release.send(()).unwrap();
        h.launcher.join();

        assert_eq!(h.launcher.stats().discarded, 1);
        assert_relative_eq!(pose_of(&h.shared, kf(30)).translation, before.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_late_keyframes_follow_the_spanning_tree() {
        let h = harness();

        assert!(matches!(h.launcher.launch(kf(52), None), LaunchOutcome::Started { .. }));
        h.entered.recv_timeout(WAIT).unwrap();

        // Created while the solver runs, so absent from its snapshot.
        let late_pose = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0), Vector3::new(0.5, -0.2, 2.0));
        let late_point = Vector3::new(3.0, 1.0, -2.0);
        let (late_kf, late_mp) = {
            let mut atlas = h.shared.atlas.write();
            let map_id = atlas.active_map_id();
            let kf_id = atlas.allocate_keyframe_id();
            atlas.add_keyframe(map_id, KeyFrame::new(kf_id, 0, late_pose, Vec::new(), Vec::new(), Vec::new()));
            let mp_id = atlas.allocate_map_point_id();
            atlas.add_map_point(map_id, MapPoint::new(mp_id, late_point, descriptor(7), kf_id));
            atlas.get_map_mut(map_id).unwrap().link_parent(kf_id, kf(30));
            (kf_id, mp_id)
        };

        h.release.send(()).unwrap();
        h.launcher.join();
        assert_eq!(h.launcher.stats().applied, 1);

        let atlas = h.shared.atlas.read();
        let expected = shift().compose(&late_pose);
        let pose = atlas.keyframe(late_kf).unwrap().pose;
        assert_relative_eq!(pose.translation, expected.translation, epsilon = 1e-9);
        assert_relative_eq!(pose.rotation_matrix(), expected.rotation_matrix(), epsilon = 1e-9);

        let map = atlas.active_map().unwrap();
        let position = map.get_map_point(late_mp).unwrap().position;
        assert_relative_eq!(position, shift().transform_point(&late_point), epsilon = 1e-9);
    }
}
