//! Geometry primitives: rigid and similarity transforms, pinhole projection.

pub mod camera;
pub mod se3;
pub mod sim3;

pub use camera::CameraModel;
pub use se3::SE3;
pub use sim3::Sim3;
