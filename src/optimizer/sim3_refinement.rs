//! Sim3 refinement against keypoint measurements.
//!
//! Given a hypothesis S_cw (matched map world → current camera) and the
//! region points it matched to keypoints of the current keyframe, minimize
//! the reprojection error. Scaling the camera-frame point about the optical
//! centre leaves every projection unchanged, so the scale found by the 3D
//! alignment is kept and only rotation and translation move. Outliers are
//! dropped by a chi² gate between the two passes.

use nalgebra::{Matrix2x6, Matrix6, Vector2, Vector3, Vector6};

use crate::geometry::{CameraModel, Sim3};

/// Region point matched to a keypoint of the current keyframe.
#[derive(Debug, Clone)]
pub struct Sim3Correspondence {
    pub point_world: Vector3<f64>,
    pub uv: Vector2<f64>,
    pub inv_sigma2: f64,
}

#[derive(Debug, Clone)]
pub struct Sim3Refinement {
    pub s_cw: Sim3,
    /// One flag per correspondence.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Refine `s_cw` with two LM passes separated by outlier rejection.
pub fn optimize_sim3(
    s_cw: &Sim3,
    correspondences: &[Sim3Correspondence],
    camera: &CameraModel,
    chi2_threshold: f64,
    iterations: usize,
) -> Sim3Refinement {
    let mut inliers = vec![true; correspondences.len()];
    let mut estimate = *s_cw;

    for pass in 0..2 {
        estimate = lm_pass(&estimate, correspondences, &inliers, camera, iterations);
        for (flag, c) in inliers.iter_mut().zip(correspondences) {
            *flag = reprojection_chi2(&estimate, c, camera).map_or(false, |x| x <= chi2_threshold);
        }
        if pass == 0 && inliers.iter().all(|&f| f) {
            break;
        }
    }

    let num_inliers = inliers.iter().filter(|&&f| f).count();
    Sim3Refinement {
        s_cw: estimate,
        inliers,
        num_inliers,
    }
}

/// Whitened squared reprojection error, None behind the camera.
pub fn reprojection_chi2(s_cw: &Sim3, c: &Sim3Correspondence, camera: &CameraModel) -> Option<f64> {
    let p_cam = s_cw.transform_point(&c.point_world);
    let uv = camera.project(&p_cam)?;
    Some((c.uv - uv).norm_squared() * c.inv_sigma2)
}

fn cost(s_cw: &Sim3, correspondences: &[Sim3Correspondence], active: &[bool], camera: &CameraModel) -> f64 {
    correspondences
        .iter()
        .zip(active)
        .filter(|(_, &a)| a)
        .map(|(c, _)| reprojection_chi2(s_cw, c, camera).unwrap_or(1e4))
        .sum()
}

/// exp([ω, v]) ∘ S with the scale untouched.
fn perturb(pose: &Sim3, delta: &Vector6<f64>) -> Sim3 {
    let tangent = [delta[0], delta[1], delta[2], delta[3], delta[4], delta[5], 0.0];
    Sim3::exp(&tangent).compose(pose)
}

fn lm_pass(
    start: &Sim3,
    correspondences: &[Sim3Correspondence],
    active: &[bool],
    camera: &CameraModel,
    iterations: usize,
) -> Sim3 {
    let mut estimate = *start;
    let mut current = cost(&estimate, correspondences, active, camera);
    let mut lambda = 1e-3;

    for _ in 0..iterations {
        let mut h = Matrix6::zeros();
        let mut g = Vector6::zeros();

        for (c, _) in correspondences.iter().zip(active).filter(|(_, &a)| a) {
            let p_cam = estimate.transform_point(&c.point_world);
            let Some(uv) = camera.project(&p_cam) else {
                continue;
            };
            let error = c.uv - uv;
            let j = projection_jacobian(&p_cam, camera);
            h += c.inv_sigma2 * j.transpose() * j;
            g += c.inv_sigma2 * j.transpose() * error;
        }

        let mut damped = h;
        for i in 0..6 {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }
        let Some(delta) = damped.lu().solve(&g) else {
            break;
        };
        if delta.norm() < 1e-12 {
            break;
        }

        let trial = perturb(&estimate, &delta);
        let trial_cost = cost(&trial, correspondences, active, camera);
        if trial_cost < current {
            estimate = trial;
            current = trial_cost;
            lambda = (lambda * 0.1).max(1e-10);
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    estimate
}

/// d(projection)/d(δ) for a left perturbation δ = [ω, v], evaluated at the
/// camera-frame point.
fn projection_jacobian(p_cam: &Vector3<f64>, camera: &CameraModel) -> Matrix2x6<f64> {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let fx = camera.fx;
    let fy = camera.fy;

    Matrix2x6::new(
        -x * y * invz2 * fx,
        (1.0 + x * x * invz2) * fx,
        -y * invz * fx,
        invz * fx,
        0.0,
        -x * invz2 * fx,
        -(1.0 + y * y * invz2) * fy,
        x * y * invz2 * fy,
        x * invz * fy,
        0.0,
        invz * fy,
        -y * invz2 * fy,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn scene(truth: &Sim3, camera: &CameraModel) -> Vec<Sim3Correspondence> {
        (0..40)
            .map(|i| {
                let p = Vector3::new(-2.0 + 0.1 * i as f64, -0.5 + 0.05 * (i % 7) as f64, 6.0 + 0.3 * (i % 4) as f64);
                let uv = camera.project(&truth.transform_point(&p)).unwrap();
                Sim3Correspondence {
                    point_world: p,
                    uv,
                    inv_sigma2: 1.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_refines_perturbed_hypothesis_and_drops_outlier() {
        let camera = CameraModel::default();
        let truth = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, -0.1, 0.05),
            translation: Vector3::new(0.3, -0.1, 0.2),
            scale: 1.0,
        };
        let mut corr = scene(&truth, &camera);
        corr[3].uv += Vector2::new(60.0, -40.0);

        let start = Sim3::exp(&[0.01, -0.01, 0.02, 0.05, 0.02, -0.04, 0.0]).compose(&truth);
        let refined = optimize_sim3(&start, &corr, &camera, 9.21, 20);

        assert!(!refined.inliers[3]);
        assert_eq!(refined.num_inliers, 39);
        assert_relative_eq!(refined.s_cw.translation, truth.translation, epsilon = 1e-6);
        assert_relative_eq!(refined.s_cw.scale, 1.0);
    }

    #[test]
    fn test_scale_from_alignment_is_kept() {
        let camera = CameraModel::default();
        let truth = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.1, 0.0, 0.0),
            scale: 1.7,
        };
        let corr = scene(&truth, &camera);
        let refined = optimize_sim3(&truth, &corr, &camera, 9.21, 10);

        assert_eq!(refined.num_inliers, corr.len());
        assert_relative_eq!(refined.s_cw.scale, 1.7, epsilon = 1e-12);
    }
}
