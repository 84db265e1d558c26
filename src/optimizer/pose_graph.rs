//! Essential Graph optimization.
//!
//! Optimizes Sim3 keyframe poses over the spanning tree, strong covisibility,
//! existing loop/merge edges and the new connections created by a
//! correction. For stereo and RGB-D the scale is fixed to 1.0.
//!
//! This module uses the three-phase pattern:
//! 1. COLLECT: Extract vertices and edges from the map
//! 2. SOLVE: Run LM optimization on the snapshot
//! 3. APPLY: Write back poses and carry map points along with their anchor

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::Sim3;

use super::OptimizationSummary;

/// Configuration for pose graph optimization.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoseGraphConfig {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,

    /// Convergence threshold on parameter change.
    pub param_tolerance: f64,

    /// Convergence threshold on gradient norm.
    pub gradient_tolerance: f64,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            param_tolerance: 1e-9,
            gradient_tolerance: 1e-9,
        }
    }
}

/// What a correction hands to the Essential Graph optimization.
pub struct EssentialGraphInput<'a> {
    /// Keyframes held constant. When empty the map origin is fixed.
    pub fixed: &'a HashSet<KeyFrameId>,

    /// Corrected world-to-camera similarities of the corrected window.
    pub corrected: &'a HashMap<KeyFrameId, Sim3>,

    /// Poses of the same keyframes before the correction.
    pub non_corrected: &'a HashMap<KeyFrameId, Sim3>,

    /// Connections created by fusing the two sides of the closure.
    pub new_connections: &'a HashMap<KeyFrameId, HashSet<KeyFrameId>>,

    /// Keyframe whose correction each map point already follows.
    pub point_anchors: &'a HashMap<MapPointId, KeyFrameId>,

    /// (current, matched) pair, always linked regardless of weight.
    pub closure_pair: Option<(KeyFrameId, KeyFrameId)>,

    /// Minimum covisibility weight for covisibility and new-connection edges.
    pub min_covisibility_weight: usize,

    /// Whether to fix scale (true for stereo).
    pub fix_scale: bool,
}

/// Type of pose graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    /// Spanning tree edge.
    SpanningTree,
    /// Connection created by the correction in progress.
    NewConnection,
    /// Previously accepted loop closure.
    LoopClosure,
    /// Previously accepted map merge.
    Merge,
    /// Strong covisibility edge.
    Covisibility,
}

/// A pose graph edge (constraint between two keyframes).
#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    pub kf_id_i: KeyFrameId,
    pub kf_id_j: KeyFrameId,

    /// Relative Sim3 measurement S_ji.
    pub measurement: Sim3,

    pub edge_type: EdgeType,
}

/// Data extracted for pose graph optimization.
pub struct PoseGraphProblemData {
    /// Keyframe IDs in optimization order.
    pub kf_ids: Vec<KeyFrameId>,

    /// Initial world-to-camera Sim3 for each keyframe.
    pub initial_poses: HashMap<KeyFrameId, Sim3>,

    pub edges: Vec<PoseGraphEdge>,

    pub fixed: HashSet<KeyFrameId>,

    pub fix_scale: bool,
}

/// Result of pose graph optimization.
pub struct PoseGraphResult {
    /// Optimized world-to-camera Sim3 poses.
    pub optimized_poses: HashMap<KeyFrameId, Sim3>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// Collect, solve and apply in one go. The caller holds the map exclusively.
pub fn optimize_essential_graph(
    map: &mut Map,
    input: &EssentialGraphInput<'_>,
    config: &PoseGraphConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<OptimizationSummary> {
    let problem = collect_pose_graph_data(map, input)?;
    let result = solve_pose_graph(&problem, config, should_stop)?;
    let updated = apply_pose_graph_results(map, &problem, &result, input.point_anchors);

    tracing::debug!(
        edges = problem.edges.len(),
        iterations = result.iterations,
        "essential graph error {:.6} -> {:.6}",
        result.initial_error,
        result.final_error
    );

    Some(OptimizationSummary {
        iterations: result.iterations,
        initial_cost: result.initial_error,
        final_cost: result.final_error,
        updated,
    })
}

/// PHASE 1: Collect pose graph data from the map.
pub fn collect_pose_graph_data(map: &Map, input: &EssentialGraphInput<'_>) -> Option<PoseGraphProblemData> {
    let mut kf_ids: Vec<KeyFrameId> = map.keyframes().filter(|kf| !kf.is_bad).map(|kf| kf.id).collect();
    if kf_ids.len() < 2 {
        return None;
    }
    kf_ids.sort();
    let present: HashSet<KeyFrameId> = kf_ids.iter().copied().collect();

    let mut initial_poses = HashMap::new();
    let mut non_corrected = HashMap::new();
    for &kf_id in &kf_ids {
        let kf = map.get_keyframe(kf_id)?;
        let current = Sim3::from_se3(&kf.pose_cw());
        initial_poses.insert(kf_id, input.corrected.get(&kf_id).copied().unwrap_or(current));
        non_corrected.insert(kf_id, input.non_corrected.get(&kf_id).copied().unwrap_or(current));
    }

    let mut fixed: HashSet<KeyFrameId> = input.fixed.iter().copied().filter(|id| present.contains(id)).collect();
    if fixed.is_empty() {
        let anchor = map
            .origin_keyframe()
            .filter(|id| present.contains(id))
            .unwrap_or(kf_ids[0]);
        fixed.insert(anchor);
    }

    let mut edges = Vec::new();
    let mut inserted: HashSet<(KeyFrameId, KeyFrameId)> = HashSet::new();
    let key = |a: KeyFrameId, b: KeyFrameId| if a < b { (a, b) } else { (b, a) };
    let relative = |poses: &HashMap<KeyFrameId, Sim3>, i: KeyFrameId, j: KeyFrameId| {
        poses[&j].compose(&poses[&i].inverse())
    };

    // New connections, measured on the corrected estimates.
    let mut sources: Vec<&KeyFrameId> = input.new_connections.keys().collect();
    sources.sort();
    for &i in sources {
        if !present.contains(&i) {
            continue;
        }
        let mut targets: Vec<KeyFrameId> = input.new_connections[&i].iter().copied().collect();
        targets.sort();
        for j in targets {
            if i == j || !present.contains(&j) {
                continue;
            }
            let is_closure_pair = input.closure_pair.map_or(false, |(a, b)| key(a, b) == key(i, j));
            let weight = map.get_keyframe(i).map_or(0, |kf| kf.get_covisibility_weight(j));
            if !is_closure_pair && weight < input.min_covisibility_weight {
                continue;
            }
            if !inserted.insert(key(i, j)) {
                continue;
            }
            edges.push(PoseGraphEdge {
                kf_id_i: i,
                kf_id_j: j,
                measurement: relative(&initial_poses, i, j),
                edge_type: EdgeType::NewConnection,
            });
        }
    }

    // Existing structure, measured on the pre-correction poses.
    for &i in &kf_ids {
        let Some(kf) = map.get_keyframe(i) else {
            continue;
        };

        if let Some(parent) = kf.parent_id.filter(|p| present.contains(p)) {
            if inserted.insert(key(i, parent)) {
                edges.push(PoseGraphEdge {
                    kf_id_i: i,
                    kf_id_j: parent,
                    measurement: relative(&non_corrected, i, parent),
                    edge_type: EdgeType::SpanningTree,
                });
            }
        }

        let mut closures: Vec<(KeyFrameId, EdgeType)> = kf
            .loop_edges
            .iter()
            .map(|&j| (j, EdgeType::LoopClosure))
            .chain(kf.merge_edges.iter().map(|&j| (j, EdgeType::Merge)))
            .filter(|(j, _)| *j < i && present.contains(j))
            .collect();
        closures.sort_by_key(|(j, _)| *j);
        for (j, edge_type) in closures {
            if inserted.insert(key(i, j)) {
                edges.push(PoseGraphEdge {
                    kf_id_i: i,
                    kf_id_j: j,
                    measurement: relative(&non_corrected, i, j),
                    edge_type,
                });
            }
        }

        let mut covisibles: Vec<KeyFrameId> = kf
            .covisibility_weights()
            .iter()
            .filter(|(&j, &w)| w >= input.min_covisibility_weight && j < i && present.contains(&j))
            .map(|(&j, _)| j)
            .collect();
        covisibles.sort();
        for j in covisibles {
            if kf.children_ids.contains(&j) || inserted.contains(&key(i, j)) {
                continue;
            }
            inserted.insert(key(i, j));
            edges.push(PoseGraphEdge {
                kf_id_i: i,
                kf_id_j: j,
                measurement: relative(&non_corrected, i, j),
                edge_type: EdgeType::Covisibility,
            });
        }
    }

    if edges.is_empty() {
        return None;
    }

    Some(PoseGraphProblemData {
        kf_ids,
        initial_poses,
        edges,
        fixed,
        fix_scale: input.fix_scale,
    })
}

/// PHASE 2: Solve pose graph optimization.
pub fn solve_pose_graph(
    problem: &PoseGraphProblemData,
    config: &PoseGraphConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<PoseGraphResult> {
    let dim = if problem.fix_scale { 6 } else { 7 };

    let free: Vec<KeyFrameId> = problem
        .kf_ids
        .iter()
        .copied()
        .filter(|id| !problem.fixed.contains(id))
        .collect();
    let free_index: HashMap<KeyFrameId, usize> = free.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let n_params = free.len() * dim;

    let mut poses = problem.initial_poses.clone();
    let initial_error = total_error(&problem.edges, &poses, dim);
    let mut current_error = initial_error;

    // LM optimization
    let mut lambda = 1e-3;
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let min_lambda = 1e-10;
    let max_lambda = 1e10;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        if should_stop() || n_params == 0 {
            break;
        }
        iterations = iter + 1;

        let (h, g) = build_system(&problem.edges, &poses, &free_index, dim, n_params);
        if g.norm() < config.gradient_tolerance {
            break;
        }

        let mut damped = h.clone();
        for i in 0..n_params {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }
        let Some(delta) = damped.lu().solve(&(-&g)) else {
            break;
        };
        if delta.norm() < config.param_tolerance {
            break;
        }

        let trial = retract_all(&poses, &free, &delta, dim);
        let trial_error = total_error(&problem.edges, &trial, dim);

        if trial_error < current_error {
            poses = trial;
            current_error = trial_error;
            lambda = (lambda * lambda_down).max(min_lambda);
        } else {
            lambda = (lambda * lambda_up).min(max_lambda);
        }
    }

    Some(PoseGraphResult {
        optimized_poses: poses,
        iterations,
        initial_error: initial_error.sqrt(),
        final_error: current_error.sqrt(),
    })
}

/// PHASE 3: Apply optimized poses and move map points with their anchor.
///
/// A point follows the keyframe listed in `point_anchors`, otherwise its
/// reference keyframe: `p' = S_opt^-1 (S_initial p)`.
pub fn apply_pose_graph_results(
    map: &mut Map,
    problem: &PoseGraphProblemData,
    results: &PoseGraphResult,
    point_anchors: &HashMap<MapPointId, KeyFrameId>,
) -> usize {
    let mut updated = 0;

    for (kf_id, s_iw) in &results.optimized_poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            if !kf.is_bad {
                kf.pose = s_iw.to_se3_normalized().inverse();
                updated += 1;
            }
        }
    }

    let mp_ids: Vec<MapPointId> = map.map_point_ids().copied().collect();
    for mp_id in mp_ids {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        if mp.is_bad {
            continue;
        }
        let anchor = point_anchors.get(&mp_id).copied().unwrap_or(mp.first_kf_id);
        let (Some(before), Some(after)) = (problem.initial_poses.get(&anchor), results.optimized_poses.get(&anchor))
        else {
            continue;
        };
        let corrected = after.inverse().transform_point(&before.transform_point(&mp.position));
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = corrected;
        }
        map.update_map_point_normal_and_depth(mp_id);
        updated += 1;
    }

    updated
}

/// Error of one edge: log(S_ji * S_iw * S_jw^-1).
fn edge_error(measurement: &Sim3, s_iw: &Sim3, s_jw: &Sim3) -> [f64; 7] {
    measurement.compose(s_iw).compose(&s_jw.inverse()).log()
}

fn total_error(edges: &[PoseGraphEdge], poses: &HashMap<KeyFrameId, Sim3>, dim: usize) -> f64 {
    edges
        .iter()
        .map(|edge| {
            let e = edge_error(&edge.measurement, &poses[&edge.kf_id_i], &poses[&edge.kf_id_j]);
            e.iter().take(dim).map(|x| x * x).sum::<f64>()
        })
        .sum()
}

/// Left perturbation exp(δ) ∘ S; the scale component is zero when fixed.
fn perturb(pose: &Sim3, delta: &[f64], dim: usize) -> Sim3 {
    let mut tangent = [0.0; 7];
    tangent[..dim].copy_from_slice(&delta[..dim]);
    Sim3::exp(&tangent).compose(pose)
}

/// Gauss-Newton system with numerical Jacobians per edge.
fn build_system(
    edges: &[PoseGraphEdge],
    poses: &HashMap<KeyFrameId, Sim3>,
    free_index: &HashMap<KeyFrameId, usize>,
    dim: usize,
    n_params: usize,
) -> (DMatrix<f64>, DVector<f64>) {
    let eps = 1e-6;
    let mut h = DMatrix::zeros(n_params, n_params);
    let mut g = DVector::zeros(n_params);

    for edge in edges {
        let s_iw = poses[&edge.kf_id_i];
        let s_jw = poses[&edge.kf_id_j];
        let e0 = edge_error(&edge.measurement, &s_iw, &s_jw);
        let residual = DVector::from_iterator(dim, e0.iter().take(dim).copied());

        // Columns: [vertex i block | vertex j block], absent when fixed.
        let mut blocks: Vec<(usize, DMatrix<f64>)> = Vec::with_capacity(2);
        for (is_i, kf_id) in [(true, edge.kf_id_i), (false, edge.kf_id_j)] {
            let Some(&idx) = free_index.get(&kf_id) else {
                continue;
            };
            let mut jac = DMatrix::zeros(dim, dim);
            for p in 0..dim {
                let mut d = [0.0; 7];
                d[p] = eps;
                let plus = perturb(if is_i { &s_iw } else { &s_jw }, &d, dim);
                d[p] = -eps;
                let minus = perturb(if is_i { &s_iw } else { &s_jw }, &d, dim);
                let (e_plus, e_minus) = if is_i {
                    (
                        edge_error(&edge.measurement, &plus, &s_jw),
                        edge_error(&edge.measurement, &minus, &s_jw),
                    )
                } else {
                    (
                        edge_error(&edge.measurement, &s_iw, &plus),
                        edge_error(&edge.measurement, &s_iw, &minus),
                    )
                };
                for r in 0..dim {
                    jac[(r, p)] = (e_plus[r] - e_minus[r]) / (2.0 * eps);
                }
            }
            blocks.push((idx * dim, jac));
        }

        for (col_a, jac_a) in &blocks {
            let grad = jac_a.transpose() * &residual;
            let mut g_block = g.rows_mut(*col_a, dim);
            g_block += grad;
            for (col_b, jac_b) in &blocks {
                let mut h_block = h.view_mut((*col_a, *col_b), (dim, dim));
                h_block += jac_a.transpose() * jac_b;
            }
        }
    }

    (h, g)
}

fn retract_all(
    poses: &HashMap<KeyFrameId, Sim3>,
    free: &[KeyFrameId],
    delta: &DVector<f64>,
    dim: usize,
) -> HashMap<KeyFrameId, Sim3> {
    let mut next = poses.clone();
    for (i, kf_id) in free.iter().enumerate() {
        if let Some(pose) = next.get_mut(kf_id) {
            let d: Vec<f64> = delta.rows(i * dim, dim).iter().copied().collect();
            *pose = perturb(pose, &d, dim);
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::{KeyFrame, MapId, MapPoint};
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn true_pose(i: u64) -> SE3 {
        let yaw = 0.3 * i as f64;
        SE3::new(
            UnitQuaternion::from_euler_angles(0.0, yaw, 0.0),
            Vector3::new(2.0 * yaw.cos(), 0.0, 2.0 * yaw.sin()),
        )
    }

    /// Five keyframes in a spanning-tree chain; the last two carry `drift`.
    fn chain_map(drift: &SE3) -> Map {
        let mut map = Map::new(MapId(0));
        for i in 0..5u64 {
            let pose = if i >= 3 { drift.compose(&true_pose(i)) } else { true_pose(i) };
            map.insert_keyframe(KeyFrame::new(KeyFrameId::new(i), i, pose, Vec::new(), Vec::new(), Vec::new()));
            if i > 0 {
                map.link_parent(KeyFrameId::new(i), KeyFrameId::new(i - 1));
            }
        }
        map
    }

    struct Inputs {
        fixed: HashSet<KeyFrameId>,
        corrected: HashMap<KeyFrameId, Sim3>,
        non_corrected: HashMap<KeyFrameId, Sim3>,
        connections: HashMap<KeyFrameId, HashSet<KeyFrameId>>,
        anchors: HashMap<MapPointId, KeyFrameId>,
    }

    impl Inputs {
        /// Loop from keyframe 4 back to keyframe 0, with 4 corrected to truth.
        fn closing(map: &Map) -> Self {
            let k0 = KeyFrameId::new(0);
            let k4 = KeyFrameId::new(4);
            Self {
                fixed: [k0].into_iter().collect(),
                corrected: [(k4, Sim3::from_se3(&true_pose(4).inverse()))].into_iter().collect(),
                non_corrected: [(k4, Sim3::from_se3(&map.get_keyframe(k4).unwrap().pose_cw()))]
                    .into_iter()
                    .collect(),
                connections: [(k4, [k0].into_iter().collect())].into_iter().collect(),
                anchors: HashMap::new(),
            }
        }

        fn input(&self) -> EssentialGraphInput<'_> {
            EssentialGraphInput {
                fixed: &self.fixed,
                corrected: &self.corrected,
                non_corrected: &self.non_corrected,
                new_connections: &self.connections,
                point_anchors: &self.anchors,
                closure_pair: Some((KeyFrameId::new(4), KeyFrameId::new(0))),
                min_covisibility_weight: 100,
                fix_scale: true,
            }
        }
    }

    #[test]
    fn test_collect_edge_types() {
        let map = chain_map(&SE3::identity());
        let inputs = Inputs::closing(&map);
        let problem = collect_pose_graph_data(&map, &inputs.input()).unwrap();

        let spanning = problem.edges.iter().filter(|e| e.edge_type == EdgeType::SpanningTree).count();
        let new = problem.edges.iter().filter(|e| e.edge_type == EdgeType::NewConnection).count();
        assert_eq!(spanning, 4);
        assert_eq!(new, 1);
        assert!(problem.fixed.contains(&KeyFrameId::new(0)));
    }

    #[test]
    fn test_consistent_graph_stays_put() {
        let mut map = chain_map(&SE3::identity());
        let inputs = Inputs::closing(&map);
        optimize_essential_graph(&mut map, &inputs.input(), &PoseGraphConfig::default(), &|| false).unwrap();

        for i in 0..5u64 {
            let pose = map.get_keyframe(KeyFrameId::new(i)).unwrap().pose;
            assert_relative_eq!(pose.translation, true_pose(i).translation, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_drift_spread_and_points_follow_anchor() {
        let drift = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.08, 0.0), Vector3::new(0.3, 0.0, -0.2));
        let mut map = chain_map(&drift);
        let k3 = KeyFrameId::new(3);
        let p_world = drift.transform_point(&Vector3::new(1.0, 0.5, 4.0));
        map.add_map_point(MapPoint::new(MapPointId::new(0), p_world, [0u8; 32], k3));
        let p_cam_before = map.get_keyframe(k3).unwrap().pose_cw().transform_point(&p_world);

        let inputs = Inputs::closing(&map);
        let problem = collect_pose_graph_data(&map, &inputs.input()).unwrap();
        let result = solve_pose_graph(&problem, &PoseGraphConfig::default(), &|| false).unwrap();
        assert!(result.final_error < result.initial_error);
        assert_eq!(
            result.optimized_poses[&KeyFrameId::new(0)],
            problem.initial_poses[&KeyFrameId::new(0)]
        );

        apply_pose_graph_results(&mut map, &problem, &result, &inputs.anchors);
        let kf3 = map.get_keyframe(k3).unwrap();
        let p_cam_after = kf3.pose_cw().transform_point(&map.get_map_point(MapPointId::new(0)).unwrap().position);
        assert_relative_eq!(p_cam_after, p_cam_before, epsilon = 1e-9);
    }
}
