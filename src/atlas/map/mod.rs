//! Map module - the arena that owns keyframes and map points.
//!
//! The map forms a bipartite graph structure:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! KeyFrames also maintain graph structures used by loop closing:
//! - **Covisibility Graph**: edges weighted by shared MapPoint count
//! - **Spanning Tree**: minimal connected structure for pose propagation
//! - **Loop / merge edges**: links created by confirmed loop closures and merges
//!
//! All cross references are ids resolved through the owning [`Map`].

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{descriptor_distance, Descriptor, KeyFrameId, KeyPoint, MapId, MapPointId};
