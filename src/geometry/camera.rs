//! Pinhole camera model used for map point projection.

use nalgebra::{Vector2, Vector3};
use serde::Deserialize;

/// Calibrated pinhole intrinsics with image bounds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Project a camera-frame point. Returns None behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some(Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    pub fn is_in_image(&self, uv: &Vector2<f64>) -> bool {
        uv.x >= 0.0 && uv.x < self.width as f64 && uv.y >= 0.0 && uv.y < self.height as f64
    }

    /// Back-project a pixel at a given depth into the camera frame.
    pub fn unproject(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }
}

impl Default for CameraModel {
    /// EuRoC cam0 intrinsics at 752x480.
    fn default() -> Self {
        Self::new(458.654, 457.296, 367.215, 248.375, 752, 480)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_unproject() {
        let cam = CameraModel::default();
        let p = cam.unproject(100.0, 200.0, 4.0);
        let uv = cam.project(&p).unwrap();
        assert_relative_eq!(uv.x, 100.0, epsilon = 1e-9);
        assert_relative_eq!(uv.y, 200.0, epsilon = 1e-9);
        assert!(cam.is_in_image(&uv));
    }

    #[test]
    fn test_behind_camera() {
        let cam = CameraModel::default();
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }
}
