//! Bundle Adjustment over keyframe poses and map points.
//!
//! Used by the global refinement thread and to weld a merged region.
//! Work is split in three phases so the expensive part runs lock-free:
//! 1. COLLECT: snapshot poses, points and observations from a map
//! 2. SOLVE: Levenberg-Marquardt on the snapshot
//! 3. APPLY: write the refined values back
//!
//! Point blocks are eliminated with the Schur complement, leaving a dense
//! system over the free cameras only.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x6, Matrix3, Matrix6x3, Vector2, Vector3, Vector6};
use serde::Deserialize;

use crate::atlas::map::{KeyFrameId, Map, MapId, MapPointId};
use crate::geometry::{CameraModel, SE3};

/// Configuration for Bundle Adjustment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,

    /// Convergence threshold on the step size.
    pub param_tolerance: f64,

    /// Convergence threshold on the gradient norm.
    pub gradient_tolerance: f64,

    /// Huber kernel threshold on the whitened reprojection error.
    pub huber_threshold: f64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            huber_threshold: 5.991_f64.sqrt(),
        }
    }
}

/// Snapshot of a bundle adjustment problem.
#[derive(Debug, Clone)]
pub struct BundleProblem {
    /// Map the snapshot was taken from.
    pub map_id: MapId,

    /// Keyframe poses (T_cw, world-to-camera).
    pub poses: HashMap<KeyFrameId, SE3>,

    /// Keyframes held constant.
    pub fixed: HashSet<KeyFrameId>,

    /// Map point positions.
    pub points: HashMap<MapPointId, Vector3<f64>>,

    /// Visual observations.
    pub observations: Vec<BundleObservation>,
}

/// A keypoint measurement of a map point.
#[derive(Debug, Clone)]
pub struct BundleObservation {
    pub kf_id: KeyFrameId,
    pub mp_id: MapPointId,
    pub uv: Vector2<f64>,
    /// Inverse variance of the keypoint's pyramid level.
    pub inv_sigma2: f64,
}

/// Result of a bundle adjustment.
#[derive(Debug, Clone)]
pub struct BundleResult {
    pub map_id: MapId,

    /// Refined keyframe poses (T_wc), free keyframes only.
    pub poses: HashMap<KeyFrameId, SE3>,

    /// Refined point positions.
    pub points: HashMap<MapPointId, Vector3<f64>>,

    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

/// PHASE 1: Snapshot every good keyframe and point of a map.
///
/// The map's origin keyframe anchors the gauge.
pub fn collect_global_problem(map: &Map) -> Option<BundleProblem> {
    let mut kf_ids: Vec<KeyFrameId> = map.keyframes().filter(|kf| !kf.is_bad).map(|kf| kf.id).collect();
    if kf_ids.is_empty() {
        return None;
    }
    kf_ids.sort();

    let anchor = map
        .origin_keyframe()
        .filter(|id| kf_ids.binary_search(id).is_ok())
        .unwrap_or(kf_ids[0]);

    let fixed: HashSet<KeyFrameId> = [anchor].into_iter().collect();
    let mp_ids: HashSet<MapPointId> = map.map_points().filter(|mp| !mp.is_bad).map(|mp| mp.id).collect();

    build_problem(map, &kf_ids, fixed, &mp_ids)
}

/// PHASE 1 (local): snapshot a window of keyframes and the points they see.
///
/// Keyframes outside the window that observe those points join as fixed
/// keyframes, as do window members listed in `fixed`. When nothing ends up
/// fixed the oldest window keyframe is fixed to anchor the gauge.
pub fn collect_local_problem(
    map: &Map,
    window: &[KeyFrameId],
    fixed: &HashSet<KeyFrameId>,
) -> Option<BundleProblem> {
    let window: Vec<KeyFrameId> = window
        .iter()
        .copied()
        .filter(|id| map.get_keyframe(*id).map_or(false, |kf| !kf.is_bad))
        .collect();
    if window.is_empty() {
        return None;
    }

    let mp_ids = map.get_map_points_from_keyframes(&window);
    let window_set: HashSet<KeyFrameId> = window.iter().copied().collect();

    let mut all_kfs = window.clone();
    let mut fixed_set: HashSet<KeyFrameId> = window.iter().copied().filter(|id| fixed.contains(id)).collect();
    let mut observers: HashSet<KeyFrameId> = HashSet::new();
    for mp_id in &mp_ids {
        if let Some(mp) = map.get_map_point(*mp_id) {
            observers.extend(mp.observations.keys().copied());
        }
    }
    let mut outside: Vec<KeyFrameId> = observers
        .into_iter()
        .filter(|id| !window_set.contains(id))
        .filter(|id| map.get_keyframe(*id).map_or(false, |kf| !kf.is_bad))
        .collect();
    outside.sort();
    fixed_set.extend(outside.iter().copied());
    all_kfs.extend(outside);

    if fixed_set.is_empty() {
        if let Some(&oldest) = window.iter().min() {
            fixed_set.insert(oldest);
        }
    }

    build_problem(map, &all_kfs, fixed_set, &mp_ids)
}

fn build_problem(
    map: &Map,
    kf_ids: &[KeyFrameId],
    fixed: HashSet<KeyFrameId>,
    mp_ids: &HashSet<MapPointId>,
) -> Option<BundleProblem> {
    let mut poses = HashMap::new();
    let mut points = HashMap::new();
    let mut observations = Vec::new();

    for &kf_id in kf_ids {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        poses.insert(kf_id, kf.pose_cw());
        for (feat_idx, mp_id) in kf.get_map_point_indices() {
            if !mp_ids.contains(&mp_id) {
                continue;
            }
            let Some(kp) = kf.keypoints.get(feat_idx) else {
                continue;
            };
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            points.entry(mp_id).or_insert(mp.position);
            let sigma = map.scale_factor_at(kp.octave);
            observations.push(BundleObservation {
                kf_id,
                mp_id,
                uv: Vector2::new(kp.u, kp.v),
                inv_sigma2: 1.0 / (sigma * sigma),
            });
        }
    }

    if observations.is_empty() {
        return None;
    }

    Some(BundleProblem {
        map_id: map.id(),
        poses,
        fixed,
        points,
        observations,
    })
}

/// Index bookkeeping for one solve.
struct Layout {
    /// Free keyframe → camera block index.
    cam_index: HashMap<KeyFrameId, usize>,
    cam_ids: Vec<KeyFrameId>,
    pt_index: HashMap<MapPointId, usize>,
    pt_ids: Vec<MapPointId>,
}

impl Layout {
    fn new(problem: &BundleProblem) -> Self {
        let mut cam_ids: Vec<KeyFrameId> = problem
            .poses
            .keys()
            .copied()
            .filter(|id| !problem.fixed.contains(id))
            .collect();
        cam_ids.sort();
        let mut pt_ids: Vec<MapPointId> = problem.points.keys().copied().collect();
        pt_ids.sort();
        Self {
            cam_index: cam_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect(),
            cam_ids,
            pt_index: pt_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect(),
            pt_ids,
        }
    }
}

/// Current estimate during the solve.
#[derive(Clone)]
struct Estimate {
    poses: HashMap<KeyFrameId, SE3>,
    points: Vec<Vector3<f64>>,
}

/// Normal equations with the point blocks kept separate.
struct NormalEquations {
    h_cc: DMatrix<f64>,
    b_c: DVector<f64>,
    h_pp: Vec<Matrix3<f64>>,
    b_p: Vec<Vector3<f64>>,
    h_cp: HashMap<(usize, usize), Matrix6x3<f64>>,
    /// Free cameras observing each point.
    point_cams: Vec<Vec<usize>>,
    gradient_norm: f64,
}

/// PHASE 2: Solve the problem with Levenberg-Marquardt.
///
/// `should_stop` is polled once per iteration; a stopped solve still returns
/// its best estimate so the caller decides whether to use it.
pub fn solve_bundle_adjustment(
    problem: &BundleProblem,
    camera: &CameraModel,
    config: &BundleConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<BundleResult> {
    let layout = Layout::new(problem);
    if layout.pt_ids.is_empty() {
        return None;
    }

    let mut estimate = Estimate {
        poses: problem.poses.clone(),
        points: layout.pt_ids.iter().map(|id| problem.points[id]).collect(),
    };

    let initial_cost = robust_cost(problem, &layout, &estimate, camera, config.huber_threshold);
    let mut cost = initial_cost;

    let mut lambda = 1e-3;
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let min_lambda = 1e-10;
    let max_lambda = 1e10;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        if should_stop() {
            break;
        }
        iterations = iter + 1;

        let system = build_normal_equations(problem, &layout, &estimate, camera, config.huber_threshold);
        if system.gradient_norm < config.gradient_tolerance {
            break;
        }

        let Some((delta_c, delta_p)) = solve_damped(&system, lambda) else {
            lambda = (lambda * lambda_up).min(max_lambda);
            continue;
        };

        let step_norm = (delta_c.norm_squared() + delta_p.iter().map(|d| d.norm_squared()).sum::<f64>()).sqrt();
        if step_norm < config.param_tolerance {
            break;
        }

        let trial = apply_step(&estimate, &layout, &delta_c, &delta_p);
        let trial_cost = robust_cost(problem, &layout, &trial, camera, config.huber_threshold);

        if trial_cost < cost {
            estimate = trial;
            cost = trial_cost;
            lambda = (lambda * lambda_down).max(min_lambda);
        } else {
            lambda = (lambda * lambda_up).min(max_lambda);
        }
    }

    let poses = layout
        .cam_ids
        .iter()
        .filter_map(|id| estimate.poses.get(id).map(|pose_cw| (*id, pose_cw.inverse())))
        .collect();
    let points = layout
        .pt_ids
        .iter()
        .zip(&estimate.points)
        .map(|(&id, &p)| (id, p))
        .collect();

    Some(BundleResult {
        map_id: problem.map_id,
        poses,
        points,
        iterations,
        initial_cost,
        final_cost: cost,
    })
}

/// PHASE 3: Write a result straight into the map.
///
/// Returns the number of updated entities. Bad entities are skipped.
pub fn apply_bundle_result(map: &mut Map, result: &BundleResult) -> usize {
    let mut updated = 0;

    for (kf_id, pose) in &result.poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            if !kf.is_bad {
                kf.pose = *pose;
                updated += 1;
            }
        }
    }

    let mut moved = Vec::new();
    for (mp_id, pos) in &result.points {
        if let Some(mp) = map.get_map_point_mut(*mp_id) {
            if !mp.is_bad {
                mp.position = *pos;
                moved.push(*mp_id);
                updated += 1;
            }
        }
    }
    for mp_id in moved {
        map.update_map_point_normal_and_depth(mp_id);
    }

    updated
}

fn huber_rho(chi2: f64, delta: f64) -> f64 {
    if chi2 <= delta * delta {
        chi2
    } else {
        2.0 * delta * chi2.sqrt() - delta * delta
    }
}

fn huber_weight(chi2: f64, delta: f64) -> f64 {
    let e = chi2.sqrt();
    if e <= delta {
        1.0
    } else {
        delta / e
    }
}

/// Penalty for a point that fell behind a camera.
const BEHIND_CAMERA_CHI2: f64 = 1e4;

fn robust_cost(
    problem: &BundleProblem,
    layout: &Layout,
    estimate: &Estimate,
    camera: &CameraModel,
    huber: f64,
) -> f64 {
    let mut cost = 0.0;
    for obs in &problem.observations {
        let (Some(pose_cw), Some(&pt)) = (estimate.poses.get(&obs.kf_id), layout.pt_index.get(&obs.mp_id)) else {
            continue;
        };
        let chi2 = match reprojection_error(pose_cw, &estimate.points[pt], &obs.uv, camera) {
            Some(e) => e.norm_squared() * obs.inv_sigma2,
            None => BEHIND_CAMERA_CHI2,
        };
        cost += huber_rho(chi2, huber);
    }
    cost
}

fn build_normal_equations(
    problem: &BundleProblem,
    layout: &Layout,
    estimate: &Estimate,
    camera: &CameraModel,
    huber: f64,
) -> NormalEquations {
    let n_cams = layout.cam_ids.len();
    let n_pts = layout.pt_ids.len();
    let mut system = NormalEquations {
        h_cc: DMatrix::zeros(n_cams * 6, n_cams * 6),
        b_c: DVector::zeros(n_cams * 6),
        h_pp: vec![Matrix3::zeros(); n_pts],
        b_p: vec![Vector3::zeros(); n_pts],
        h_cp: HashMap::new(),
        point_cams: vec![Vec::new(); n_pts],
        gradient_norm: 0.0,
    };

    for obs in &problem.observations {
        let (Some(pose_cw), Some(&pt)) = (estimate.poses.get(&obs.kf_id), layout.pt_index.get(&obs.mp_id)) else {
            continue;
        };
        let point = estimate.points[pt];
        let Some(error) = reprojection_error(pose_cw, &point, &obs.uv, camera) else {
            continue;
        };
        let chi2 = error.norm_squared() * obs.inv_sigma2;
        let w = huber_weight(chi2, huber) * obs.inv_sigma2;

        let j_p = jacobian_point(pose_cw, &point, camera);
        system.h_pp[pt] += w * j_p.transpose() * j_p;
        system.b_p[pt] -= w * j_p.transpose() * error;

        if let Some(&cam) = layout.cam_index.get(&obs.kf_id) {
            let j_c = jacobian_pose(pose_cw, &point, camera);
            let base = cam * 6;
            let mut block = system.h_cc.fixed_view_mut::<6, 6>(base, base);
            block += w * j_c.transpose() * j_c;
            let mut rhs = system.b_c.fixed_rows_mut::<6>(base);
            rhs -= w * j_c.transpose() * error;

            *system.h_cp.entry((cam, pt)).or_insert_with(Matrix6x3::zeros) += w * j_c.transpose() * j_p;
            if !system.point_cams[pt].contains(&cam) {
                system.point_cams[pt].push(cam);
            }
        }
    }

    let grad_sq = system.b_c.norm_squared() + system.b_p.iter().map(|b| b.norm_squared()).sum::<f64>();
    system.gradient_norm = grad_sq.sqrt();
    system
}

/// Solve the damped system, eliminating points first.
fn solve_damped(system: &NormalEquations, lambda: f64) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
    let n_c = system.b_c.len();

    let h_pp_inv: Vec<Matrix3<f64>> = system
        .h_pp
        .iter()
        .map(|h| {
            let mut damped = *h;
            for i in 0..3 {
                damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
            }
            // Unconstrained points stay where they are.
            damped.try_inverse().unwrap_or_else(Matrix3::zeros)
        })
        .collect();

    let mut schur = system.h_cc.clone();
    for i in 0..n_c {
        schur[(i, i)] += lambda * schur[(i, i)].max(1e-6);
    }
    let mut rhs = system.b_c.clone();

    for (pt, cams) in system.point_cams.iter().enumerate() {
        for &i in cams {
            let Some(h_ip) = system.h_cp.get(&(i, pt)) else {
                continue;
            };
            let w_ip = h_ip * h_pp_inv[pt];
            let mut rhs_i = rhs.fixed_rows_mut::<6>(i * 6);
            rhs_i -= w_ip * system.b_p[pt];
            for &k in cams {
                let Some(h_kp) = system.h_cp.get(&(k, pt)) else {
                    continue;
                };
                let mut block = schur.fixed_view_mut::<6, 6>(i * 6, k * 6);
                block -= w_ip * h_kp.transpose();
            }
        }
    }

    let delta_c = if n_c == 0 {
        DVector::zeros(0)
    } else {
        match schur.clone().cholesky() {
            Some(chol) => chol.solve(&rhs),
            None => schur.lu().solve(&rhs)?,
        }
    };

    let delta_p = system
        .b_p
        .iter()
        .enumerate()
        .map(|(pt, b)| {
            let mut r = *b;
            for &i in &system.point_cams[pt] {
                if let Some(h_ip) = system.h_cp.get(&(i, pt)) {
                    let dc: Vector6<f64> = delta_c.fixed_rows::<6>(i * 6).into_owned();
                    r -= h_ip.transpose() * dc;
                }
            }
            h_pp_inv[pt] * r
        })
        .collect();

    Some((delta_c, delta_p))
}

fn apply_step(estimate: &Estimate, layout: &Layout, delta_c: &DVector<f64>, delta_p: &[Vector3<f64>]) -> Estimate {
    let mut next = estimate.clone();
    for (i, id) in layout.cam_ids.iter().enumerate() {
        if let Some(pose) = next.poses.get_mut(id) {
            let d = delta_c.fixed_rows::<6>(i * 6);
            *pose = pose.retract_left(&[d[0], d[1], d[2], d[3], d[4], d[5]]);
        }
    }
    for (p, d) in next.points.iter_mut().zip(delta_p) {
        *p += d;
    }
    next
}

/// Observed minus projected pixel. None behind the camera.
fn reprojection_error(
    pose_cw: &SE3,
    point: &Vector3<f64>,
    observed: &Vector2<f64>,
    camera: &CameraModel,
) -> Option<Vector2<f64>> {
    let p_cam = pose_cw.transform_point(point);
    if p_cam.z <= 0.001 {
        return None;
    }
    let uv = camera.project(&p_cam)?;
    Some(observed - uv)
}

/// d(error)/d(δ) for a left perturbation δ = [ω, v] of T_cw.
fn jacobian_pose(pose_cw: &SE3, point: &Vector3<f64>, camera: &CameraModel) -> Matrix2x6<f64> {
    let p_cam = pose_cw.transform_point(point);

    let x = p_cam.x;
    let y = p_cam.y;
    let z = p_cam.z;

    if z.abs() < 1e-6 {
        return Matrix2x6::zeros();
    }

    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let fx = camera.fx;
    let fy = camera.fy;

    Matrix2x6::new(
        x * y * invz2 * fx,
        -(1.0 + x * x * invz2) * fx,
        y * invz * fx,
        -invz * fx,
        0.0,
        x * invz2 * fx,
        (1.0 + y * y * invz2) * fy,
        -x * y * invz2 * fy,
        -x * invz * fy,
        0.0,
        -invz * fy,
        y * invz2 * fy,
    )
}

fn jacobian_point(pose_cw: &SE3, point: &Vector3<f64>, camera: &CameraModel) -> Matrix2x3<f64> {
    let p_cam = pose_cw.transform_point(point);

    let x = p_cam.x;
    let y = p_cam.y;
    let z = p_cam.z;

    if z.abs() < 1e-6 {
        return Matrix2x3::zeros();
    }

    let invz = 1.0 / z;
    let fx = camera.fx;
    let fy = camera.fy;

    let r_cw = pose_cw.rotation_matrix();
    let tmp = Matrix2x3::new(fx, 0.0, -fx * x * invz, 0.0, fy, -fy * y * invz);

    (-invz) * tmp * r_cw
}
