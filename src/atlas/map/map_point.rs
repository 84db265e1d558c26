//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! MapPoints are the fundamental 3D structure elements in the map.
//! Each MapPoint tracks which KeyFrames observe it and stores viewing
//! geometry constraints. A point retired by fusion keeps a forward
//! reference to the point that replaced it.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::types::{Descriptor, KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
///
/// MapPoints form the sparse 3D reconstruction of the environment.
/// They track observations from KeyFrames and the bookkeeping needed to
/// fuse duplicates found by loop closing.
#[derive(Clone)]
pub struct MapPoint {
    /// Unique identifier for this MapPoint.
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative ORB descriptor.
    pub descriptor: Descriptor,

    /// KeyFrames observing this point, mapped to feature index in that KeyFrame.
    /// observation[kf_id] = feature_idx means keyframe kf_id sees this point at feature_idx.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    /// Computed as average of all observation directions.
    pub normal: Vector3<f64>,

    /// Minimum distance at which this point can be reliably observed.
    /// Based on ORB scale pyramid - points have scale invariance limits.
    pub min_distance: f64,

    /// Maximum distance at which this point can be reliably observed.
    pub max_distance: f64,

    /// Number of times this point was visible in a frame (in frustum).
    pub visible_count: u32,

    /// Number of times this point was successfully matched/found.
    pub found_count: u32,

    /// Reference KeyFrame, used to carry corrections to points a refinement
    /// did not see.
    pub first_kf_id: KeyFrameId,

    /// Whether this point is marked as bad (should be removed).
    pub is_bad: bool,

    /// Survivor this point was fused into, if any.
    pub replaced_by: Option<MapPointId>,
}

impl MapPoint {
    /// Create a new MapPoint.
    ///
    /// # Arguments
    /// * `id` - Unique identifier
    /// * `position` - 3D position in world frame
    /// * `descriptor` - Representative ORB descriptor
    /// * `first_kf_id` - KeyFrame that created this point
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 0,
            found_count: 0,
            first_kf_id,
            is_bad: false,
            replaced_by: None,
        }
    }

    /// Add an observation from a KeyFrame.
    ///
    /// # Arguments
    /// * `kf_id` - KeyFrame that observes this point
    /// * `feature_idx` - Index of the feature in the KeyFrame's feature list
    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Remove an observation.
    ///
    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    /// Get the number of KeyFrames observing this point.
    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Increment visible count (point was in camera frustum).
    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    /// Increment found count (point was successfully matched).
    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    /// Feature index under which a keyframe observes this point.
    pub fn index_in(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.get(&kf_id).copied()
    }

    /// Mark this point as bad.
    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Update the mean normal vector and distance bounds.
    ///
    /// Should be called after observations change.
    /// Requires access to KeyFrame positions, so this is typically called
    /// from the Map container which has access to both.
    ///
    /// # Arguments
    /// * `kf_positions` - Iterator of (KeyFrameId, position) for observing KeyFrames
    /// * `scale_factor` - ORB scale factor per level (typically 1.2)
    /// * `num_levels` - Number of scale levels in ORB pyramid (typically 8)
    pub fn update_normal_and_depth<'a>(
        &mut self,
        kf_positions: impl Iterator<Item = (&'a KeyFrameId, &'a Vector3<f64>)>,
        scale_factor: f64,
        num_levels: u32,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut min_dist = f64::INFINITY;
        let mut max_dist = 0.0f64;

        for (_, kf_pos) in kf_positions {
            let dir = self.position - kf_pos;
            let dist = dir.norm();

            if dist > 1e-10 {
                normal_sum += dir / dist;
                min_dist = min_dist.min(dist);
                max_dist = max_dist.max(dist);
            }
        }

        let norm = normal_sum.norm();
        if norm > 1e-10 {
            self.normal = normal_sum / norm;
        }

        // Scale bounds by ORB pyramid range
        let scale_range = scale_factor.powi(num_levels as i32 - 1);
        self.min_distance = min_dist / scale_range;
        self.max_distance = max_dist * scale_range;
    }

    /// Check if a viewing distance is within the valid range.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Pyramid level at which the point is expected when seen from `distance`.
    ///
    /// The farthest observation is taken as level 0; seeing the point from
    /// closer pushes it up the pyramid.
    pub fn predict_scale(&self, distance: f64, scale_factor: f64, num_levels: u32) -> i32 {
        let top = num_levels.saturating_sub(1) as i32;
        if distance <= 0.0 || !self.max_distance.is_finite() || scale_factor <= 1.0 {
            return 0;
        }
        let reference = self.max_distance / scale_factor.powi(top);
        let level = ((reference / distance).ln() / scale_factor.ln() - 1e-9).ceil() as i32;
        level.clamp(0, top)
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .field("is_bad", &self.is_bad)
            .field("replaced_by", &self.replaced_by)
            .finish()
    }
}
