//! Loop and merge correction.
//!
//! Both corrections follow the same three phases on the map that ends up
//! holding the closure:
//! 1. COLLECT: the window of keyframes around the current keyframe with
//!    their poses before and after the correction
//! 2. SOLVE: corrected map point positions, each point following the first
//!    window keyframe that sees it
//! 3. APPLY: write poses and points, fuse the matched region into the
//!    window, record closure edges and hand the rest to the optimizer
//!
//! A loop corrects the current side in place. A merge first moves the
//! matched map into the active map's frame and unions the two arenas, so
//! the window poses are already right and only welding remains.
//!
//! Corrected poses are absolute: `S_iw = S_ic * S_cw` with `S_ic` taken
//! from the current relative pose, so applying the same hypothesis twice
//! lands on the same poses.

use std::collections::{HashMap, HashSet, VecDeque};

use nalgebra::Vector3;
use serde::Deserialize;
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, Map, MapId, MapPointId};
use crate::atlas::Atlas;
use crate::geometry::{CameraModel, Sim3};
use crate::optimizer::{EssentialGraphInput, MapOptimizer, OptimizationSummary};

use super::matcher::{fuse, FuseStats};
use super::verifier::Hypothesis;

/// Which correction to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionKind {
    Loop,
    /// `scale_reliable` is false for monocular maps, whose relative scale
    /// is only known up to the hypothesis.
    Merge { scale_reliable: bool },
}

/// Configuration for loop and merge correction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrectorConfig {
    /// Covisibility hops from the current keyframe corrected explicitly.
    pub propagation_depth: usize,
    /// Minimum covisibility weight followed while propagating.
    pub min_propagation_weight: usize,
    /// Fuse search radius in pixels.
    pub fuse_radius: f64,
    /// Keyframes per side of a merge that are welded.
    pub welding_window: usize,
    /// Minimum covisibility weight for Essential Graph edges.
    pub essential_graph_min_weight: usize,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            propagation_depth: 1,
            min_propagation_weight: 0,
            fuse_radius: 4.0,
            welding_window: 15,
            essential_graph_min_weight: 100,
        }
    }
}

/// What a correction did.
#[derive(Debug, Clone)]
pub struct CorrectionReport {
    pub kind: CorrectionKind,
    pub current_kf: KeyFrameId,
    pub matched_kf: KeyFrameId,
    /// Map holding the closure afterwards.
    pub map_id: MapId,
    /// Map absorbed by a merge.
    pub absorbed_map: Option<MapId>,
    pub corrected_keyframes: usize,
    pub corrected_points: usize,
    pub fused: FuseStats,
    pub new_connections: usize,
    pub essential_graph: Option<OptimizationSummary>,
    pub local_ba: Option<OptimizationSummary>,
}

/// Poses of the correction window.
struct Window {
    /// Current keyframe first, the rest by id.
    order: Vec<KeyFrameId>,
    corrected: HashMap<KeyFrameId, Sim3>,
    non_corrected: HashMap<KeyFrameId, Sim3>,
}

/// Applies confirmed hypotheses to the atlas.
pub struct Corrector {
    config: CorrectorConfig,
    camera: CameraModel,
    fix_scale: bool,
}

impl Corrector {
    pub fn new(config: CorrectorConfig, camera: CameraModel, fix_scale: bool) -> Self {
        Self {
            config,
            camera,
            fix_scale,
        }
    }

    pub fn config(&self) -> &CorrectorConfig {
        &self.config
    }

    /// Apply `hypothesis`, verified last by its `last_current_kf`.
    ///
    /// The caller holds the atlas exclusively with local mapping paused.
    /// Returns None when the keyframes involved are gone.
    pub fn correct(
        &self,
        atlas: &mut Atlas,
        hypothesis: &Hypothesis,
        kind: CorrectionKind,
        optimizer: &dyn MapOptimizer,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<CorrectionReport> {
        match kind {
            CorrectionKind::Loop => self.correct_loop(atlas, hypothesis, optimizer, should_stop),
            CorrectionKind::Merge { scale_reliable } => {
                self.correct_merge(atlas, hypothesis, scale_reliable, optimizer, should_stop)
            }
        }
    }

    fn correct_loop(
        &self,
        atlas: &mut Atlas,
        hypothesis: &Hypothesis,
        optimizer: &dyn MapOptimizer,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<CorrectionReport> {
        let current_kf = hypothesis.last_current_kf;
        let matched_kf = hypothesis.matched_kf;
        let map_id = atlas.map_of(current_kf)?;
        if atlas.map_of(matched_kf)? != map_id {
            return None;
        }
        let map = atlas.get_map_mut(map_id)?;
        map.update_connections(current_kf);

        // Phase 1: COLLECT
        let window = self.loop_window(map, current_kf, &hypothesis.s_cw)?;
        let previous = covisibles_of(map, &window.order);

        // Phase 2: SOLVE
        let (points, anchors) = correct_points(map, &window);

        // Phase 3: APPLY
        for (&mp_id, position) in &points {
            if let Some(mp) = map.get_map_point_mut(mp_id) {
                mp.position = *position;
            }
        }
        for (kf_id, s_iw) in &window.corrected {
            if let Some(kf) = map.get_keyframe_mut(*kf_id) {
                kf.pose = s_iw.to_se3_normalized().inverse();
            }
        }
        for &mp_id in points.keys() {
            map.update_map_point_normal_and_depth(mp_id);
        }

        let mut fused = fuse_matches(map, current_kf, &hypothesis.matches);
        for &kf_id in &window.order {
            let Some(s_iw) = window.corrected.get(&kf_id) else {
                continue;
            };
            let stats = fuse(map, kf_id, s_iw, &hypothesis.region_points, &self.camera, self.config.fuse_radius);
            fused.replaced += stats.replaced;
            fused.added += stats.added;
        }

        let members: HashSet<KeyFrameId> = window.order.iter().copied().collect();
        let new_connections = new_connections(map, &window.order, &previous, &members);

        let fixed: HashSet<KeyFrameId> = [matched_kf].into_iter().collect();
        let essential_graph = optimizer.optimize_essential_graph(
            map,
            &EssentialGraphInput {
                fixed: &fixed,
                corrected: &window.corrected,
                non_corrected: &window.non_corrected,
                new_connections: &new_connections,
                point_anchors: &anchors,
                closure_pair: Some((current_kf, matched_kf)),
                min_covisibility_weight: self.config.essential_graph_min_weight,
                fix_scale: self.fix_scale,
            },
            should_stop,
        );

        if let Some(kf) = map.get_keyframe_mut(current_kf) {
            kf.add_loop_edge(matched_kf);
        }
        if let Some(kf) = map.get_keyframe_mut(matched_kf) {
            kf.add_loop_edge(current_kf);
        }

        let report = CorrectionReport {
            kind: CorrectionKind::Loop,
            current_kf,
            matched_kf,
            map_id,
            absorbed_map: None,
            corrected_keyframes: window.order.len(),
            corrected_points: points.len(),
            fused,
            new_connections: new_connections.values().map(HashSet::len).sum(),
            essential_graph,
            local_ba: None,
        };
        info!(
            current = %current_kf,
            matched = %matched_kf,
            keyframes = report.corrected_keyframes,
            points = report.corrected_points,
            replaced = fused.replaced,
            added = fused.added,
            "loop corrected"
        );
        Some(report)
    }

    fn correct_merge(
        &self,
        atlas: &mut Atlas,
        hypothesis: &Hypothesis,
        scale_reliable: bool,
        optimizer: &dyn MapOptimizer,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<CorrectionReport> {
        let current_kf = hypothesis.last_current_kf;
        let matched_kf = hypothesis.matched_kf;
        let map_id = atlas.map_of(current_kf)?;
        let absorbed = atlas.map_of(matched_kf)?;
        if absorbed == map_id {
            return None;
        }

        // Express the matched map in the current map's world and union them.
        let t_wc = atlas.keyframe(current_kf)?.pose;
        let s_am = Sim3::from_se3(&t_wc).compose(&hypothesis.s_cw);
        let moved = {
            let other = atlas.get_map_mut(absorbed)?;
            other.transform_world(&s_am);
            (other.num_keyframes(), other.num_map_points())
        };
        if !atlas.merge_maps(map_id, absorbed) {
            return None;
        }
        let map = atlas.get_map_mut(map_id)?;

        map.reroot_spanning_tree(matched_kf);
        map.link_parent(matched_kf, current_kf);
        if let Some(kf) = map.get_keyframe_mut(current_kf) {
            kf.add_merge_edge(matched_kf);
        }
        if let Some(kf) = map.get_keyframe_mut(matched_kf) {
            kf.add_merge_edge(current_kf);
        }

        // Welding windows on both sides of the seam.
        let size = self.config.welding_window.max(1);
        let mut current_side = vec![current_kf];
        current_side.extend(map.get_local_keyframes(current_kf, size - 1));
        let mut region_side = vec![matched_kf];
        region_side.extend(map.get_local_keyframes(matched_kf, size - 1));
        region_side.retain(|kf| !current_side.contains(kf));
        let previous = covisibles_of(map, &current_side);

        let mut fused = fuse_matches(map, current_kf, &hypothesis.matches);
        for &kf_id in &current_side {
            let Some(s_iw) = map.get_keyframe(kf_id).map(|kf| Sim3::from_se3(&kf.pose_cw())) else {
                continue;
            };
            let stats = fuse(map, kf_id, &s_iw, &hypothesis.region_points, &self.camera, self.config.fuse_radius);
            fused.replaced += stats.replaced;
            fused.added += stats.added;
        }

        let members: HashSet<KeyFrameId> = current_side.iter().chain(&region_side).copied().collect();
        let new_connections = new_connections(map, &current_side, &previous, &members);
        for &kf_id in &region_side {
            map.update_connections(kf_id);
        }

        let fixed: HashSet<KeyFrameId> = region_side.iter().copied().collect();
        let essential_graph = if scale_reliable {
            None
        } else {
            let poses: HashMap<KeyFrameId, Sim3> = current_side
                .iter()
                .filter_map(|&id| Some((id, Sim3::from_se3(&map.get_keyframe(id)?.pose_cw()))))
                .collect();
            let anchors = HashMap::new();
            optimizer.optimize_essential_graph(
                map,
                &EssentialGraphInput {
                    fixed: &fixed,
                    corrected: &poses,
                    non_corrected: &poses,
                    new_connections: &new_connections,
                    point_anchors: &anchors,
                    closure_pair: Some((current_kf, matched_kf)),
                    min_covisibility_weight: self.config.essential_graph_min_weight,
                    fix_scale: false,
                },
                should_stop,
            )
        };

        let local_ba = optimizer.local_bundle_adjustment(map, &current_side, &fixed, should_stop);

        let report = CorrectionReport {
            kind: CorrectionKind::Merge { scale_reliable },
            current_kf,
            matched_kf,
            map_id,
            absorbed_map: Some(absorbed),
            corrected_keyframes: moved.0,
            corrected_points: moved.1,
            fused,
            new_connections: new_connections.values().map(HashSet::len).sum(),
            essential_graph,
            local_ba,
        };
        info!(
            current = %current_kf,
            matched = %matched_kf,
            into = %map_id,
            from = %absorbed,
            scale = s_am.scale,
            replaced = fused.replaced,
            added = fused.added,
            "maps merged"
        );
        Some(report)
    }

    /// Current keyframe and its covisibility neighbourhood with corrected
    /// and uncorrected poses.
    fn loop_window(&self, map: &Map, current_kf: KeyFrameId, s_cw: &Sim3) -> Option<Window> {
        let current = map.get_keyframe(current_kf)?;
        let t_wc = current.pose;

        let mut order = vec![current_kf];
        let mut visited: HashSet<KeyFrameId> = order.iter().copied().collect();
        let mut queue: VecDeque<(KeyFrameId, usize)> = VecDeque::from([(current_kf, 0)]);
        while let Some((kf_id, depth)) = queue.pop_front() {
            if depth >= self.config.propagation_depth {
                continue;
            }
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            let mut neighbours: Vec<(KeyFrameId, usize)> = kf
                .covisibility_weights()
                .iter()
                .filter(|(_, &w)| w >= self.config.min_propagation_weight)
                .map(|(&id, &w)| (id, w))
                .collect();
            neighbours.sort_by(|a, b| a.0.cmp(&b.0));
            for (id, _) in neighbours {
                if map.get_keyframe(id).map_or(true, |k| k.is_bad) || !visited.insert(id) {
                    continue;
                }
                order.push(id);
                queue.push_back((id, depth + 1));
            }
        }
        order[1..].sort();

        let mut corrected = HashMap::new();
        let mut non_corrected = HashMap::new();
        for &kf_id in &order {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            let t_iw = kf.pose_cw();
            let s_ic = Sim3::from_se3(&t_iw.compose(&t_wc));
            corrected.insert(kf_id, s_ic.compose(s_cw));
            non_corrected.insert(kf_id, Sim3::from_se3(&t_iw));
        }

        debug!(current = %current_kf, window = order.len(), "loop correction window");
        Some(Window {
            order,
            corrected,
            non_corrected,
        })
    }
}

/// Move every point seen by the window with the first window keyframe that
/// sees it: `p' = S_corr^-1 * S_noncorr * p`.
fn correct_points(map: &Map, window: &Window) -> (HashMap<MapPointId, Vector3<f64>>, HashMap<MapPointId, KeyFrameId>) {
    let mut points = HashMap::new();
    let mut anchors = HashMap::new();
    for &kf_id in &window.order {
        let (Some(kf), Some(corrected), Some(non_corrected)) = (
            map.get_keyframe(kf_id),
            window.corrected.get(&kf_id),
            window.non_corrected.get(&kf_id),
        ) else {
            continue;
        };
        let correction = corrected.inverse().compose(non_corrected);
        for (_, mp_id) in kf.get_map_point_indices() {
            if anchors.contains_key(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
                continue;
            };
            points.insert(mp_id, correction.transform_point(&mp.position));
            anchors.insert(mp_id, kf_id);
        }
    }
    (points, anchors)
}

/// Fold the verified `(feature, region point)` matches into the current
/// keyframe: its own point is retired in favour of the region point, a free
/// feature starts observing it.
fn fuse_matches(map: &mut Map, current_kf: KeyFrameId, matches: &[(usize, MapPointId)]) -> FuseStats {
    let mut stats = FuseStats::default();
    for &(idx, region_mp) in matches {
        let Some(region_mp) = map.resolve(region_mp) else {
            continue;
        };
        let existing = map
            .get_keyframe(current_kf)
            .and_then(|kf| kf.get_map_point(idx))
            .and_then(|mp| map.resolve(mp));
        match existing {
            Some(existing) if existing == region_mp => {}
            Some(existing) => {
                if map.replace_map_point(existing, region_mp) {
                    stats.replaced += 1;
                }
            }
            None => {
                let observed = map
                    .get_map_point(region_mp)
                    .map_or(true, |mp| mp.observations.contains_key(&current_kf));
                if !observed && map.associate(current_kf, idx, region_mp) {
                    stats.added += 1;
                }
            }
        }
    }
    stats
}

fn covisibles_of(map: &Map, kf_ids: &[KeyFrameId]) -> HashMap<KeyFrameId, HashSet<KeyFrameId>> {
    kf_ids
        .iter()
        .filter_map(|&id| Some((id, map.get_keyframe(id)?.get_covisibles().copied().collect())))
        .collect()
}

/// Refresh covisibility of `kf_ids` and report links that did not exist
/// before and leave `members`.
fn new_connections(
    map: &mut Map,
    kf_ids: &[KeyFrameId],
    previous: &HashMap<KeyFrameId, HashSet<KeyFrameId>>,
    members: &HashSet<KeyFrameId>,
) -> HashMap<KeyFrameId, HashSet<KeyFrameId>> {
    let mut links = HashMap::new();
    for &kf_id in kf_ids {
        map.update_connections(kf_id);
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        let fresh: HashSet<KeyFrameId> = kf
            .get_covisibles()
            .copied()
            .filter(|id| !members.contains(id))
            .filter(|id| previous.get(&kf_id).map_or(true, |before| !before.contains(id)))
            .collect();
        if !fresh.is_empty() {
            links.insert(kf_id, fresh);
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_closing::verifier::RegionKind;
    use crate::test_support::{kf, loop_scene, merge_scene, scaled_loop_scene, RecordingOptimizer};
    use approx::assert_relative_eq;

    /// The hypothesis a perfect verification of keyframe `current` would produce.
    fn exact_hypothesis(
        atlas: &Atlas,
        kind: RegionKind,
        current: KeyFrameId,
        matched: KeyFrameId,
        s_cw: Sim3,
        matches: Vec<(usize, MapPointId)>,
    ) -> Hypothesis {
        let map_id = atlas.map_of(matched).unwrap();
        let map = atlas.get_map(map_id).unwrap();
        let mut window = vec![matched];
        window.extend(map.get_local_keyframes(matched, 10));
        let mut region_points: Vec<MapPointId> = map.get_map_points_from_keyframes(&window).into_iter().collect();
        region_points.sort();
        Hypothesis {
            kind,
            matched_kf: matched,
            matched_map: map_id,
            last_current_kf: current,
            s_cw,
            region_points,
            matches,
            coincidences: 3,
            failures: 0,
        }
    }

    fn never() -> bool {
        false
    }

    #[test]
    fn test_loop_correction_removes_drift_and_fuses_duplicates() {
        let mut scene = loop_scene();
        let current = kf(48);
        let matched = kf(0);
        let s_cw = Sim3::from_se3(&scene.true_pose(current).inverse());
        let hypothesis = exact_hypothesis(&scene.atlas, RegionKind::Loop, current, matched, s_cw, Vec::new());
        let optimizer = RecordingOptimizer::default();
        let corrector = Corrector::new(CorrectorConfig::default(), scene.camera, true);

        let report = corrector
            .correct(&mut scene.atlas, &hypothesis, CorrectionKind::Loop, &optimizer, &never)
            .unwrap();

        // Every drifted neighbour of 48 is back on its true pose.
        for k in [46, 47, 48, 49, 50] {
            let pose = scene.atlas.keyframe(kf(k)).unwrap().pose;
            let truth = scene.true_pose(kf(k));
            assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-9);
            assert_relative_eq!(pose.rotation_matrix(), truth.rotation_matrix(), epsilon = 1e-9);
        }
        assert!(report.corrected_keyframes >= 5);
        assert!(report.fused.replaced > 50);

        // Duplicates seen from 48 now resolve to the first-pass points.
        let map = scene.atlas.get_map(scene.map_id).unwrap();
        let current_kf = map.get_keyframe(current).unwrap();
        let mut checked = 0;
        for (dup, original) in &scene.duplicates {
            if current_kf.get_map_point_indices().any(|(_, mp)| mp == *original) {
                assert_eq!(map.resolve(*dup), Some(*original));
                checked += 1;
            }
        }
        assert!(checked > 50);

        assert!(current_kf.loop_edges.contains(&matched));
        assert!(map.get_keyframe(matched).unwrap().loop_edges.contains(&current));

        let calls = optimizer.essential_graph_calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].closure_pair, Some((current, matched)));
        assert!(calls[0].fixed.contains(&matched));
        assert!(calls[0].corrected.contains(&current));
        assert!(calls[0].new_connections > 0);
        assert!(calls[0].fix_scale);
    }

    #[test]
    fn test_monocular_loop_correction_removes_scale_drift() {
        let mut scene = scaled_loop_scene(0.8);
        let current = kf(48);
        let t_cw = scene.true_pose(current).inverse();
        let s_cw = Sim3 {
            rotation: t_cw.rotation,
            translation: t_cw.translation * 0.8,
            scale: 0.8,
        };
        let hypothesis = exact_hypothesis(&scene.atlas, RegionKind::Loop, current, kf(0), s_cw, Vec::new());
        let optimizer = RecordingOptimizer::default();
        let corrector = Corrector::new(CorrectorConfig::default(), scene.camera, false);

        let report = corrector
            .correct(&mut scene.atlas, &hypothesis, CorrectionKind::Loop, &optimizer, &never)
            .unwrap();
        assert!(report.corrected_points > 0);

        let map = scene.atlas.get_map(scene.map_id).unwrap();
        for k in [46, 47, 48, 49, 50] {
            let keyframe = map.get_keyframe(kf(k)).unwrap();
            let truth = scene.true_pose(kf(k));
            assert_relative_eq!(keyframe.pose.translation, truth.translation, epsilon = 1e-9);
            assert_relative_eq!(keyframe.pose.rotation_matrix(), truth.rotation_matrix(), epsilon = 1e-9);
        }

        // Camera-frame depths were mapped at 0.8 of their true size; the
        // corrected points sit back at full depth.
        let keyframe = map.get_keyframe(current).unwrap();
        let t_cw = keyframe.pose.inverse();
        let mut checked = 0;
        for (idx, mp_id) in keyframe.get_map_point_indices() {
            let (Some(mp), Some(p_cam)) = (map.get_map_point(mp_id), keyframe.points_cam[idx]) else {
                continue;
            };
            assert_relative_eq!(t_cw.transform_point(&mp.position) * 0.8, p_cam, epsilon = 1e-9);
            checked += 1;
        }
        assert!(checked > 50);
        assert!(!optimizer.essential_graph_calls.lock()[0].fix_scale);
    }

    #[test]
    fn test_loop_correction_is_idempotent() {
        let mut scene = loop_scene();
        let current = kf(48);
        let s_cw = Sim3::from_se3(&scene.true_pose(current).inverse());
        let hypothesis = exact_hypothesis(&scene.atlas, RegionKind::Loop, current, kf(0), s_cw, Vec::new());
        let optimizer = RecordingOptimizer::default();
        let corrector = Corrector::new(CorrectorConfig::default(), scene.camera, true);

        corrector.correct(&mut scene.atlas, &hypothesis, CorrectionKind::Loop, &optimizer, &never);
        let map_id = scene.map_id;
        let snapshot = |atlas: &Atlas| -> Vec<(crate::geometry::SE3, Vector3<f64>)> {
            let map = atlas.get_map(map_id).unwrap();
            let kf48 = map.get_keyframe(current).unwrap();
            kf48.get_map_point_indices()
                .filter_map(|(_, mp)| map.get_map_point(mp))
                .map(|mp| (kf48.pose, mp.position))
                .collect()
        };
        let first = snapshot(&scene.atlas);

        let again = corrector
            .correct(&mut scene.atlas, &hypothesis, CorrectionKind::Loop, &optimizer, &never)
            .unwrap();
        let second = snapshot(&scene.atlas);

        assert_eq!(again.fused.replaced, 0);
        assert_eq!(first.len(), second.len());
        for ((pose_a, p_a), (pose_b, p_b)) in first.iter().zip(&second) {
            assert_relative_eq!(pose_a.translation, pose_b.translation, epsilon = 1e-9);
            assert_relative_eq!(p_a, p_b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_merge_unions_maps_in_the_active_frame() {
        let mut scene = merge_scene();
        let current = kf(24);
        let matched = kf(8);
        // Old map world → current camera.
        let s_cw = Sim3::from_se3(&scene.true_pose(current).inverse());
        let hypothesis = exact_hypothesis(&scene.atlas, RegionKind::Merge, current, matched, s_cw, Vec::new());
        let optimizer = RecordingOptimizer::default();
        let corrector = Corrector::new(CorrectorConfig::default(), scene.camera, true);

        let report = corrector
            .correct(
                &mut scene.atlas,
                &hypothesis,
                CorrectionKind::Merge { scale_reliable: true },
                &optimizer,
                &never,
            )
            .unwrap();

        assert_eq!(report.map_id, scene.active_map);
        assert_eq!(report.absorbed_map, Some(scene.old_map));
        assert_eq!(scene.atlas.num_maps(), 1);
        assert_eq!(scene.atlas.active_map_id(), scene.active_map);
        assert_eq!(scene.atlas.map_of(kf(0)), Some(scene.active_map));

        // Old keyframes now live in the active world.
        for k in [0, 5, 8] {
            let pose = scene.atlas.keyframe(kf(k)).unwrap().pose;
            let expected = scene.frame.compose(&scene.true_pose(kf(k)));
            assert_relative_eq!(pose.translation, expected.translation, epsilon = 1e-9);
        }

        let map = scene.atlas.active_map().unwrap();
        assert_eq!(map.get_keyframe(matched).unwrap().parent_id, Some(current));
        assert!(map.get_keyframe(current).unwrap().merge_edges.contains(&matched));
        assert!(report.fused.replaced > 50);

        let current_frame = map.get_keyframe(current).unwrap();
        let fused = scene
            .duplicates
            .iter()
            .filter(|(_, original)| current_frame.get_map_point_indices().any(|(_, mp)| mp == **original))
            .filter(|(dup, original)| map.resolve(**dup) == Some(**original))
            .count();
        assert!(fused > 50);

        // Reliable scale: straight to the bounded BA.
        assert!(optimizer.essential_graph_calls.lock().is_empty());
        let ba = optimizer.local_ba_calls.lock();
        assert_eq!(ba.len(), 1);
        let (window, fixed) = &ba[0];
        assert_eq!(window[0], current);
        assert!(window.len() <= 15);
        assert!(fixed.contains(&matched));
        assert!(window.iter().all(|kf| !fixed.contains(kf)));
    }

    #[test]
    fn test_scale_ambiguous_merge_runs_pose_graph_first() {
        let mut scene = merge_scene();
        let current = kf(24);
        let s_cw = Sim3::from_se3(&scene.true_pose(current).inverse());
        let hypothesis = exact_hypothesis(&scene.atlas, RegionKind::Merge, current, kf(8), s_cw, Vec::new());
        let optimizer = RecordingOptimizer::default();
        let corrector = Corrector::new(CorrectorConfig::default(), scene.camera, false);

        corrector
            .correct(
                &mut scene.atlas,
                &hypothesis,
                CorrectionKind::Merge { scale_reliable: false },
                &optimizer,
                &never,
            )
            .unwrap();

        let calls = optimizer.essential_graph_calls.lock();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].fix_scale);
        assert_eq!(calls[0].closure_pair, Some((current, kf(8))));
        assert_eq!(optimizer.local_ba_calls.lock().len(), 1);
    }

    #[test]
    fn test_merge_within_one_map_is_refused() {
        let mut scene = loop_scene();
        let s_cw = Sim3::from_se3(&scene.true_pose(kf(48)).inverse());
        let hypothesis = exact_hypothesis(&scene.atlas, RegionKind::Merge, kf(48), kf(0), s_cw, Vec::new());
        let corrector = Corrector::new(CorrectorConfig::default(), scene.camera, true);
        assert!(corrector
            .correct(
                &mut scene.atlas,
                &hypothesis,
                CorrectionKind::Merge { scale_reliable: true },
                &RecordingOptimizer::default(),
                &never,
            )
            .is_none());
    }
}
