//! Sim3 solver using Horn's method with RANSAC.
//!
//! Computes the similarity transformation between the camera frames of two
//! keyframes from matched map points. Hypotheses are scored by reprojection
//! in both images, gated by chi² at the keypoint's pyramid level.
//! For stereo mode, scale is fixed to 1.0.

use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};
use rand::prelude::*;
use serde::Deserialize;

use crate::geometry::{CameraModel, Sim3};

/// Configuration for Sim3 RANSAC solver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Sim3SolverConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Minimum number of inliers required.
    pub min_inliers: usize,
    /// Probability of finding a good model.
    pub probability: f64,
    /// Chi² gate on the whitened reprojection error (2 DOF, 99%).
    pub chi2_threshold: f64,
}

impl Default for Sim3SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            min_inliers: 15,
            probability: 0.99,
            chi2_threshold: 9.21,
        }
    }
}

/// One map point correspondence between the current and matched keyframes.
#[derive(Debug, Clone)]
pub struct Sim3Match {
    /// Current keyframe's point in its camera frame.
    pub p_current: Vector3<f64>,
    /// Keypoint of that point in the current image.
    pub uv_current: Vector2<f64>,
    pub inv_sigma2_current: f64,
    /// Matched keyframe's point in its camera frame.
    pub p_matched: Vector3<f64>,
    pub uv_matched: Vector2<f64>,
    pub inv_sigma2_matched: f64,
}

/// Result from Sim3 RANSAC solver.
#[derive(Debug, Clone)]
pub struct Sim3Result {
    /// S_cm: matched camera frame → current camera frame.
    pub sim3: Sim3,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Number of inliers.
    pub num_inliers: usize,
}

/// Compute S_cm with Horn's method inside RANSAC.
///
/// Returns `None` when no hypothesis reaches `config.min_inliers`.
pub fn compute_sim3_ransac(
    matches: &[Sim3Match],
    camera: &CameraModel,
    fix_scale: bool,
    config: &Sim3SolverConfig,
) -> Option<Sim3Result> {
    let n = matches.len();
    if n < 3 || n < config.min_inliers {
        return None;
    }

    let mut rng = rand::thread_rng();
    let mut best_result: Option<Sim3Result> = None;
    let mut best_inliers = 0;

    // Adaptive number of iterations based on inlier ratio
    let mut max_iter = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iter {
        iteration += 1;
        let indices = sample_three_indices(&mut rng, n);

        let sample_matched: Vec<_> = indices.iter().map(|&i| matches[i].p_matched).collect();
        let sample_current: Vec<_> = indices.iter().map(|&i| matches[i].p_current).collect();

        let Some(sim3) = compute_sim3_horn(&sample_matched, &sample_current, fix_scale) else {
            continue;
        };

        let inliers = find_inliers(matches, &sim3, camera, config.chi2_threshold);

        if inliers.len() > best_inliers {
            best_inliers = inliers.len();
            best_result = Some(Sim3Result {
                sim3,
                num_inliers: inliers.len(),
                inliers,
            });

            if best_inliers >= config.min_inliers {
                let inlier_ratio = best_inliers as f64 / n as f64;
                let updated_iter = compute_adaptive_iterations(inlier_ratio, config.probability, 3);
                max_iter = max_iter.min(iteration.saturating_add(updated_iter));
            }
        }
    }

    // Refine with all inliers if we have a good result
    if let Some(ref mut result) = best_result {
        if result.num_inliers >= config.min_inliers {
            let inlier_matched: Vec<_> = result.inliers.iter().map(|&i| matches[i].p_matched).collect();
            let inlier_current: Vec<_> = result.inliers.iter().map(|&i| matches[i].p_current).collect();

            if let Some(refined) = compute_sim3_horn(&inlier_matched, &inlier_current, fix_scale) {
                let new_inliers = find_inliers(matches, &refined, camera, config.chi2_threshold);
                if new_inliers.len() >= result.num_inliers {
                    result.sim3 = refined;
                    result.num_inliers = new_inliers.len();
                    result.inliers = new_inliers;
                }
            }
        }
    }

    best_result.filter(|r| r.num_inliers >= config.min_inliers)
}

/// Compute Sim3 using Horn's method (closed-form solution).
///
/// Finds S with `points2 ≈ S * points1`:
/// 1. Compute centroids of both point sets
/// 2. Center the points
/// 3. Compute scale (if not fixed): s = sqrt(sum(||p2||²) / sum(||p1||²))
/// 4. Compute rotation via SVD of cross-covariance matrix
/// 5. Compute translation: t = c2 - s * R * c1
///
/// Reference: B.K.P. Horn, "Closed-form solution of absolute orientation using unit quaternions"
pub fn compute_sim3_horn(points1: &[Vector3<f64>], points2: &[Vector3<f64>], fix_scale: bool) -> Option<Sim3> {
    let n = points1.len();
    if n < 3 || n != points2.len() {
        return None;
    }

    let centroid1 = compute_centroid(points1);
    let centroid2 = compute_centroid(points2);

    let centered1: Vec<_> = points1.iter().map(|p| p - centroid1).collect();
    let centered2: Vec<_> = points2.iter().map(|p| p - centroid2).collect();

    let sum_sq1: f64 = centered1.iter().map(|p| p.norm_squared()).sum();
    if sum_sq1 < 1e-10 {
        return None;
    }
    let scale = if fix_scale {
        1.0
    } else {
        let sum_sq2: f64 = centered2.iter().map(|p| p.norm_squared()).sum();
        (sum_sq2 / sum_sq1).sqrt()
    };

    // Cross-covariance matrix: H = sum(p1_i * p2_i^T)
    let mut h = Matrix3::zeros();
    for (c1, c2) in centered1.iter().zip(&centered2) {
        h += c1 * c2.transpose();
    }

    // SVD: H = U * S * V^T
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    // R = V * U^T
    let mut rotation_mat = v_t.transpose() * u.transpose();

    // Handle reflection case (det(R) = -1)
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(rotation_mat));
    let translation = centroid2 - scale * (rotation * centroid1);

    Some(Sim3 {
        rotation,
        translation,
        scale,
    })
}

fn compute_centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

/// Correspondences that reproject within the gate in both images.
fn find_inliers(matches: &[Sim3Match], s_cm: &Sim3, camera: &CameraModel, chi2_threshold: f64) -> Vec<usize> {
    let s_mc = s_cm.inverse();
    matches
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            let in_current = gated(camera, &s_cm.transform_point(&m.p_matched), &m.uv_current, m.inv_sigma2_current, chi2_threshold);
            let in_matched = gated(camera, &s_mc.transform_point(&m.p_current), &m.uv_matched, m.inv_sigma2_matched, chi2_threshold);
            in_current && in_matched
        })
        .map(|(i, _)| i)
        .collect()
}

fn gated(camera: &CameraModel, p_cam: &Vector3<f64>, uv: &Vector2<f64>, inv_sigma2: f64, chi2_threshold: f64) -> bool {
    camera
        .project(p_cam)
        .map_or(false, |proj| (proj - uv).norm_squared() * inv_sigma2 < chi2_threshold)
}

/// Sample three unique random indices.
fn sample_three_indices(rng: &mut impl Rng, n: usize) -> [usize; 3] {
    let mut indices = [0usize; 3];
    indices[0] = rng.gen_range(0..n);

    loop {
        indices[1] = rng.gen_range(0..n);
        if indices[1] != indices[0] {
            break;
        }
    }

    loop {
        indices[2] = rng.gen_range(0..n);
        if indices[2] != indices[0] && indices[2] != indices[1] {
            break;
        }
    }

    indices
}

/// Compute adaptive number of RANSAC iterations.
fn compute_adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    // k = log(1 - p) / log(1 - w^n)
    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();

    if log_denom.abs() < 1e-10 {
        return 1;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}
