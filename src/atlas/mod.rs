//! Atlas module - Multi-map SLAM data structures.
//!
//! - [`map`]: the per-map arena of keyframes and map points
//! - [`atlas`]: the multi-map container with a single active map
//! - [`keyframe_db`]: the place recognition index used to find loop and
//!   merge candidates

pub mod atlas;
pub mod keyframe_db;
pub mod map;

pub use atlas::Atlas;
pub use keyframe_db::{Candidate, CandidateSet, KeyFrameDatabase, PlaceQuery, PlaceRecognition};
pub use map::{KeyFrame, KeyFrameId, KeyPoint, Map, MapId, MapPoint, MapPointId};
