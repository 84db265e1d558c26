//! Synthetic scenes and collaborator doubles shared by the unit tests.
//!
//! Keyframes sit on a circle of radius 4 looking outward at a cylindrical
//! wall of radius 10. Landmarks on the wall are grouped into "places" every
//! 4 degrees; a place is one visual word. Every landmark has its own random
//! descriptor so matching is unambiguous.

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector2, Vector3};
use parking_lot::Mutex;

use crate::atlas::map::{Descriptor, KeyFrame, KeyFrameId, KeyPoint, MapId, MapPoint, MapPointId};
use crate::atlas::keyframe_db::PlaceRecognition;
use crate::atlas::Atlas;
use crate::geometry::{CameraModel, Sim3, SE3};
use crate::optimizer::{BundleProblem, BundleResult, EssentialGraphInput, MapOptimizer, OptimizationSummary};
use crate::system::LocalMappingControl;
use crate::vocabulary::{BowVector, FeatureVector, OrbVocabulary};

/// Keyframes on one lap.
const LAP: f64 = 49.0;
const PLACES: usize = 90;
const PER_PLACE: usize = 24;

pub fn camera() -> CameraModel {
    CameraModel::new(900.0, 900.0, 376.0, 240.0, 752, 480)
}

pub fn kf(k: u64) -> KeyFrameId {
    KeyFrameId::new(k)
}

/// Pseudo-random descriptor (splitmix64).
pub fn descriptor(seed: u64) -> Descriptor {
    let mut state = seed.wrapping_mul(0x2545_f491_4f6c_dd1d);
    let mut d = [0u8; 32];
    for chunk in d.chunks_mut(8) {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        chunk.copy_from_slice(&(z ^ (z >> 31)).to_le_bytes());
    }
    d
}

/// True camera-to-world pose of the keyframe at lap position `index`.
pub fn circle_pose(index: f64) -> SE3 {
    let theta = 2.0 * PI * index / LAP;
    let forward = Vector3::new(theta.cos(), theta.sin(), 0.0);
    let down = Vector3::new(0.0, 0.0, -1.0);
    let right = down.cross(&forward);
    let rotation = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[right, down, forward]));
    SE3::new(UnitQuaternion::from_rotation_matrix(&rotation), forward * 4.0)
}

struct Landmark {
    position: Vector3<f64>,
    place: u32,
}

fn landmarks() -> Vec<Landmark> {
    let mut out = Vec::with_capacity(PLACES * PER_PLACE);
    for place in 0..PLACES {
        for j in 0..PER_PLACE {
            let degrees = 4.0 * place as f64 + ((j % 6) as f64 - 2.5) * 0.5;
            let phi = degrees.to_radians();
            let height = -1.2 + (j / 6) as f64 * 0.8;
            out.push(Landmark {
                position: Vector3::new(10.0 * phi.cos(), 10.0 * phi.sin(), height),
                place: place as u32,
            });
        }
    }
    out
}

/// Atlas under construction.
struct Builder {
    atlas: Atlas,
    camera: CameraModel,
    landmarks: Vec<Landmark>,
    /// (map, landmark, duplicate) → point.
    points: HashMap<(MapId, usize, bool), MapPointId>,
    truth: HashMap<KeyFrameId, SE3>,
}

impl Builder {
    fn new() -> Self {
        Self {
            atlas: Atlas::new(),
            camera: camera(),
            landmarks: landmarks(),
            points: HashMap::new(),
            truth: HashMap::new(),
        }
    }

    /// Landmarks visible from a true pose with their pixels.
    fn visible(&self, pose: &SE3) -> Vec<(usize, Vector2<f64>, Vector3<f64>)> {
        let t_cw = pose.inverse();
        self.landmarks
            .iter()
            .enumerate()
            .filter_map(|(l, lm)| {
                let p_cam = t_cw.transform_point(&lm.position);
                let uv = self.camera.project(&p_cam)?;
                let inside = uv.x >= 4.0
                    && uv.x <= self.camera.width as f64 - 4.0
                    && uv.y >= 4.0
                    && uv.y <= self.camera.height as f64 - 4.0;
                inside.then_some((l, uv, p_cam))
            })
            .collect()
    }

    /// Add a keyframe at lap position `index`. Its stored pose and any
    /// point it creates are expressed through `frame`; a scaled frame also
    /// scales the camera-frame points. Landmarks for which `duplicate` holds
    /// get a separate point.
    fn add_keyframe(&mut self, map_id: MapId, index: f64, frame: &Sim3, duplicate: impl Fn(usize) -> bool) -> KeyFrameId {
        let truth = circle_pose(index);
        let stored = SE3::new(frame.rotation * truth.rotation, frame.transform_point(&truth.translation));
        let seen = self.visible(&truth);
        let id = self.atlas.allocate_keyframe_id();

        let mut bow = BowVector::new();
        let mut features = FeatureVector::new();
        for (idx, (l, _, _)) in seen.iter().enumerate() {
            let place = self.landmarks[*l].place;
            *bow.entry(place).or_insert(0.0) += 1.0 / seen.len() as f64;
            features.entry(place).or_default().push(idx);
        }

        let mut keyframe = KeyFrame::new(
            id,
            id.0 * 100_000_000,
            stored,
            seen.iter().map(|(_, uv, _)| KeyPoint::new(uv.x, uv.y, 0)).collect(),
            seen.iter().map(|(l, _, _)| descriptor(*l as u64)).collect(),
            seen.iter().map(|(_, _, p)| Some(p * frame.scale)).collect(),
        );
        keyframe.set_bow_vector(bow);
        keyframe.set_feature_vector(features);
        assert!(self.atlas.add_keyframe(map_id, keyframe));
        self.truth.insert(id, truth);

        for (idx, (l, _, _)) in seen.iter().enumerate() {
            let key = (map_id, *l, duplicate(*l));
            let mp_id = match self.points.get(&key) {
                Some(&mp_id) => mp_id,
                None => {
                    let mp_id = self.atlas.allocate_map_point_id();
                    let position = frame.transform_point(&self.landmarks[*l].position);
                    assert!(self
                        .atlas
                        .add_map_point(map_id, MapPoint::new(mp_id, position, descriptor(*l as u64), id)));
                    self.points.insert(key, mp_id);
                    mp_id
                }
            };
            assert!(self.atlas.get_map_mut(map_id).unwrap().associate(id, idx, mp_id));
        }
        self.atlas.get_map_mut(map_id).unwrap().update_connections(id);
        id
    }

    fn finish_map(&mut self, map_id: MapId) {
        let map = self.atlas.get_map_mut(map_id).unwrap();
        let mut ids: Vec<KeyFrameId> = map.keyframe_ids().copied().collect();
        ids.sort();
        for id in ids {
            map.update_connections(id);
        }
        let points: Vec<MapPointId> = map.map_point_ids().copied().collect();
        for mp_id in points {
            map.update_map_point_normal_and_depth(mp_id);
        }
    }
}

/// A map that drifted on its second pass over the start of the lap.
pub struct LoopScene {
    pub atlas: Atlas,
    pub camera: CameraModel,
    pub map_id: MapId,
    /// World drift applied to keyframes [`LoopScene::DRIFT_FROM`] onwards.
    pub drift: Sim3,
    /// Second-pass duplicate → first-pass point.
    pub duplicates: HashMap<MapPointId, MapPointId>,
    truth: HashMap<KeyFrameId, SE3>,
}

impl LoopScene {
    pub const NUM_KEYFRAMES: u64 = 53;
    /// Keyframes before this one are the first pass over the start.
    pub const FIRST_PASS: u64 = 7;
    pub const DRIFT_FROM: u64 = 45;

    pub fn true_pose(&self, kf_id: KeyFrameId) -> SE3 {
        self.truth[&kf_id]
    }

    /// Index keyframes `0..until` in a place recognition database.
    pub fn index(&self, db: &dyn PlaceRecognition, until: u64) {
        for k in 0..until {
            let keyframe = self.atlas.keyframe(kf(k)).unwrap();
            db.add(keyframe.id, self.map_id, keyframe.bow_vector().unwrap());
        }
    }
}

/// Keyframes 0..53 at lap positions k - 1, so 50 and 1 coincide. From
/// keyframe 45 on the trajectory carries a drift, and landmarks already
/// mapped by the first pass were mapped again as duplicates.
pub fn loop_scene() -> LoopScene {
    scaled_loop_scene(1.0)
}

/// [`loop_scene`] whose drift also rescales the second pass by `scale`, as
/// a monocular map would.
pub fn scaled_loop_scene(scale: f64) -> LoopScene {
    let mut builder = Builder::new();
    let map_id = builder.atlas.active_map_id();
    let drift = Sim3 {
        rotation: UnitQuaternion::from_euler_angles(0.0, 0.0, 0.05),
        translation: Vector3::new(0.3, -0.2, 0.05),
        scale,
    };

    let first_pass: Vec<SE3> = (0..LoopScene::FIRST_PASS).map(|k| circle_pose(k as f64 - 1.0)).collect();
    let mut seen_first: HashSet<usize> = HashSet::new();
    for pose in &first_pass {
        seen_first.extend(builder.visible(pose).into_iter().map(|(l, _, _)| l));
    }

    for k in 0..LoopScene::NUM_KEYFRAMES {
        let drifted = k >= LoopScene::DRIFT_FROM;
        let frame = if drifted { drift } else { Sim3::identity() };
        let id = builder.add_keyframe(map_id, k as f64 - 1.0, &frame, |l| drifted && seen_first.contains(&l));
        assert_eq!(id, kf(k));
    }
    builder.finish_map(map_id);

    let duplicates = builder
        .points
        .iter()
        .filter(|((_, _, dup), _)| *dup)
        .filter_map(|(&(map, l, _), &dup_id)| Some((dup_id, *builder.points.get(&(map, l, false))?)))
        .collect();

    LoopScene {
        atlas: builder.atlas,
        camera: builder.camera,
        map_id,
        drift,
        duplicates,
        truth: builder.truth,
    }
}

/// An old map and a newer active map, expressed in different world frames,
/// that overlap around lap position 7.
pub struct MergeScene {
    pub atlas: Atlas,
    pub camera: CameraModel,
    pub old_map: MapId,
    pub active_map: MapId,
    /// Pose of the old map's world in the active map's world.
    pub frame: SE3,
    /// Active map point → old map point of the same landmark.
    pub duplicates: HashMap<MapPointId, MapPointId>,
    truth: HashMap<KeyFrameId, SE3>,
}

impl MergeScene {
    /// Keyframes 0..12 belong to the old map, 12..25 to the active one.
    pub const OLD_KEYFRAMES: u64 = 12;
    pub const NUM_KEYFRAMES: u64 = 25;

    pub fn true_pose(&self, kf_id: KeyFrameId) -> SE3 {
        self.truth[&kf_id]
    }

    pub fn index(&self, db: &dyn PlaceRecognition, until: u64) {
        for k in 0..until {
            let map_id = self.atlas.map_of(kf(k)).unwrap();
            let keyframe = self.atlas.keyframe(kf(k)).unwrap();
            db.add(keyframe.id, map_id, keyframe.bow_vector().unwrap());
        }
    }
}

/// The old map walks forward from lap position -1 to 10; the active map
/// walks back from 19 to 7, ending where old keyframe 8 stood.
pub fn merge_scene() -> MergeScene {
    let mut builder = Builder::new();
    let old_map = builder.atlas.active_map_id();
    for k in 0..MergeScene::OLD_KEYFRAMES {
        builder.add_keyframe(old_map, k as f64 - 1.0, &Sim3::identity(), |_| false);
    }
    builder.finish_map(old_map);

    let frame = SE3::new(
        UnitQuaternion::from_euler_angles(0.0, 0.0, 0.7),
        Vector3::new(2.0, -1.0, 0.3),
    );
    let active_map = builder.atlas.create_new_map();
    for t in 0..(MergeScene::NUM_KEYFRAMES - MergeScene::OLD_KEYFRAMES) {
        builder.add_keyframe(active_map, 19.0 - t as f64, &Sim3::from_se3(&frame), |_| false);
    }
    builder.finish_map(active_map);

    let duplicates = builder
        .points
        .iter()
        .filter(|((map, _, _), _)| *map == active_map)
        .filter_map(|(&(_, l, _), &id)| Some((id, *builder.points.get(&(old_map, l, false))?)))
        .collect();

    MergeScene {
        atlas: builder.atlas,
        camera: builder.camera,
        old_map,
        active_map,
        frame,
        duplicates,
        truth: builder.truth,
    }
}

/// Local mapping double that pauses as soon as it is asked to.
#[derive(Default)]
pub struct ObedientMapper {
    paused: AtomicBool,
    pub pause_requests: AtomicUsize,
    pub resumes: AtomicUsize,
}

impl LocalMappingControl for ObedientMapper {
    fn request_pause(&self) {
        self.pause_requests.fetch_add(1, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn interrupt(&self) {}

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// What a correction handed to the Essential Graph optimization.
#[derive(Debug, Clone)]
pub struct EssentialGraphCall {
    pub fixed: HashSet<KeyFrameId>,
    pub corrected: HashSet<KeyFrameId>,
    pub closure_pair: Option<(KeyFrameId, KeyFrameId)>,
    pub new_connections: usize,
    pub min_covisibility_weight: usize,
    pub fix_scale: bool,
}

/// Optimizer double that records its calls and leaves the map untouched.
/// Global BA returns the snapshot unchanged.
#[derive(Default)]
pub struct RecordingOptimizer {
    pub essential_graph_calls: Mutex<Vec<EssentialGraphCall>>,
    pub local_ba_calls: Mutex<Vec<(Vec<KeyFrameId>, HashSet<KeyFrameId>)>>,
    pub global_ba_calls: AtomicUsize,
}

impl MapOptimizer for RecordingOptimizer {
    fn optimize_essential_graph(
        &self,
        _map: &mut crate::atlas::map::Map,
        input: &EssentialGraphInput<'_>,
        _should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationSummary> {
        self.essential_graph_calls.lock().push(EssentialGraphCall {
            fixed: input.fixed.clone(),
            corrected: input.corrected.keys().copied().collect(),
            closure_pair: input.closure_pair,
            new_connections: input.new_connections.values().map(HashSet::len).sum(),
            min_covisibility_weight: input.min_covisibility_weight,
            fix_scale: input.fix_scale,
        });
        None
    }

    fn local_bundle_adjustment(
        &self,
        _map: &mut crate::atlas::map::Map,
        window: &[KeyFrameId],
        fixed: &HashSet<KeyFrameId>,
        _should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationSummary> {
        self.local_ba_calls.lock().push((window.to_vec(), fixed.clone()));
        None
    }

    fn global_bundle_adjustment(&self, problem: &BundleProblem, _should_stop: &dyn Fn() -> bool) -> Option<BundleResult> {
        self.global_ba_calls.fetch_add(1, Ordering::SeqCst);
        Some(BundleResult {
            map_id: problem.map_id,
            poses: problem
                .poses
                .iter()
                .filter(|(id, _)| !problem.fixed.contains(id))
                .map(|(&id, t_cw)| (id, t_cw.inverse()))
                .collect(),
            points: problem.points.clone(),
            iterations: 0,
            initial_cost: 0.0,
            final_cost: 0.0,
        })
    }
}

/// Global BA double that blocks until released (or stopped) and then moves
/// the whole map by [`shift`]. The other passes do nothing.
pub struct GatedOptimizer {
    entered: Sender<()>,
    release: Receiver<()>,
    pub stopped: AtomicBool,
    pub calls: AtomicUsize,
}

/// One metre along x.
pub fn shift() -> SE3 {
    SE3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0))
}

/// The optimizer, a receiver signalled when global BA starts, and a sender
/// that lets it finish.
pub fn gated_optimizer() -> (Arc<GatedOptimizer>, Receiver<()>, Sender<()>) {
    let (entered_tx, entered) = unbounded();
    let (release, release_rx) = unbounded();
    let optimizer = Arc::new(GatedOptimizer {
        entered: entered_tx,
        release: release_rx,
        stopped: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
    });
    (optimizer, entered, release)
}

impl MapOptimizer for GatedOptimizer {
    fn optimize_essential_graph(
        &self,
        _map: &mut crate::atlas::map::Map,
        _input: &EssentialGraphInput<'_>,
        _should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationSummary> {
        None
    }

    fn local_bundle_adjustment(
        &self,
        _map: &mut crate::atlas::map::Map,
        _window: &[KeyFrameId],
        _fixed: &HashSet<KeyFrameId>,
        _should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationSummary> {
        None
    }

    fn global_bundle_adjustment(&self, problem: &BundleProblem, should_stop: &dyn Fn() -> bool) -> Option<BundleResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.entered.send(());
        loop {
            if should_stop() {
                self.stopped.store(true, Ordering::SeqCst);
                break;
            }
            if self.release.recv_timeout(Duration::from_millis(1)).is_ok() {
                break;
            }
        }
        Some(BundleResult {
            map_id: problem.map_id,
            poses: problem
                .poses
                .iter()
                .filter(|(id, _)| !problem.fixed.contains(id))
                .map(|(&id, t_cw)| (id, shift().compose(&t_cw.inverse())))
                .collect(),
            points: problem
                .points
                .iter()
                .map(|(&id, p)| (id, shift().transform_point(p)))
                .collect(),
            iterations: 1,
            initial_cost: 1.0,
            final_cost: 0.5,
        })
    }
}

/// DBoW2 text vocabulary with two words: all-zero (IDF 1) and all-one
/// (IDF 2) descriptors.
pub fn two_word_vocabulary() -> OrbVocabulary {
    let zeros = vec!["0"; 32].join(" ");
    let ones = vec!["255"; 32].join(" ");
    let text = format!("2 1 0 0\n0 1 {} 1.0\n0 1 {} 2.0\n", zeros, ones);
    OrbVocabulary::from_reader(text.as_bytes()).unwrap()
}
