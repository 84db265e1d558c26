//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map is the arena that holds one connected piece of the SLAM graph:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility relationships between KeyFrames
//!
//! It provides methods for:
//! - Adding KeyFrames and MapPoints
//! - Creating bidirectional associations (KF↔MP)
//! - Fusing duplicate MapPoints (with a replacement tombstone table)
//! - Recomputing covisibility after fusion
//! - Absorbing another Map and re-expressing a whole Map in a new frame

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::geometry::Sim3;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapId, MapPointId};

/// Minimum shared observations for a covisibility edge.
pub const COVISIBILITY_THRESHOLD: usize = 15;

/// The SLAM map containing KeyFrames and MapPoints.
pub struct Map {
    id: MapId,

    /// All KeyFrames in the map.
    keyframes: HashMap<KeyFrameId, KeyFrame>,

    /// All live MapPoints in the map.
    map_points: HashMap<MapPointId, MapPoint>,

    /// Retired MapPoint → the point it was fused into.
    replaced: HashMap<MapPointId, MapPointId>,

    /// ORB scale factor (typically 1.2).
    orb_scale_factor: f64,

    /// Number of ORB pyramid levels (typically 8).
    orb_num_levels: u32,

    /// First KeyFrame of the map (spanning tree root at creation).
    origin_kf: Option<KeyFrameId>,

    /// Most recent KeyFrame ID (tail of temporal chain).
    last_keyframe_id: Option<KeyFrameId>,
}

impl Map {
    /// Create a new empty Map.
    pub fn new(id: MapId) -> Self {
        Self {
            id,
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            replaced: HashMap::new(),
            orb_scale_factor: 1.2,
            orb_num_levels: 8,
            origin_kf: None,
            last_keyframe_id: None,
        }
    }

    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn origin_keyframe(&self) -> Option<KeyFrameId> {
        self.origin_kf
    }

    /// Scale factor of a pyramid level: 1.2^octave for the default pyramid.
    pub fn scale_factor_at(&self, octave: i32) -> f64 {
        self.orb_scale_factor.powi(octave.max(0))
    }

    pub fn orb_scale_factor(&self) -> f64 {
        self.orb_scale_factor
    }

    pub fn orb_num_levels(&self) -> u32 {
        self.orb_num_levels
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a KeyFrame, linking it after the previous one in temporal order.
    pub fn insert_keyframe(&mut self, mut kf: KeyFrame) {
        let id = kf.id;
        if let Some(prev_id) = self.last_keyframe_id {
            kf.prev_kf = Some(prev_id);
            if let Some(prev_kf) = self.keyframes.get_mut(&prev_id) {
                prev_kf.next_kf = Some(id);
            }
        }
        if self.origin_kf.is_none() {
            self.origin_kf = Some(id);
        }
        self.keyframes.insert(id, kf);
        self.last_keyframe_id = Some(id);
    }

    /// Get the most recent KeyFrame ID.
    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_keyframe_id
    }

    /// Get a KeyFrame by ID.
    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    /// Get a mutable reference to a KeyFrame by ID.
    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn contains_keyframe(&self, id: KeyFrameId) -> bool {
        self.keyframes.contains_key(&id)
    }

    /// Get all KeyFrame IDs.
    pub fn keyframe_ids(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.keyframes.keys()
    }

    /// Get all KeyFrames.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    /// Get the number of KeyFrames.
    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Add an existing MapPoint to the map.
    pub fn add_map_point(&mut self, mp: MapPoint) {
        self.map_points.insert(mp.id, mp);
    }

    /// Get a MapPoint by ID.
    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    /// Get a mutable reference to a MapPoint by ID.
    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    /// Get all MapPoint IDs.
    pub fn map_point_ids(&self) -> impl Iterator<Item = &MapPointId> {
        self.map_points.keys()
    }

    /// Get all MapPoints.
    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    /// Get the number of MapPoints.
    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Follow fusion tombstones to the surviving point.
    ///
    /// Returns None when the chain ends at a point that no longer exists.
    pub fn resolve(&self, mut id: MapPointId) -> Option<MapPointId> {
        // Chains are acyclic: a survivor is never retired into its own victim.
        for _ in 0..=self.replaced.len() {
            if self.map_points.contains_key(&id) {
                return Some(id);
            }
            id = *self.replaced.get(&id)?;
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// This:
    /// 1. Links the KeyFrame's feature to the MapPoint
    /// 2. Adds an observation in the MapPoint
    /// 3. Updates covisibility with other KeyFrames observing this MapPoint
    ///
    /// Returns true if the association was created successfully.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        if !self.keyframes.contains_key(&kf_id) {
            return false;
        }

        let existing_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                let observers = mp.observations.keys().copied().collect();
                mp.add_observation(kf_id, feature_idx);
                observers
            }
            None => return false,
        };

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_kf_id in existing_observers {
            if other_kf_id == kf_id {
                continue;
            }

            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;

            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }

        true
    }

    /// Remove the association between a KeyFrame feature and its MapPoint.
    ///
    /// Covisibility is left to [`Map::update_connections`].
    /// Returns the MapPoint ID that was disassociated, if any.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }
        Some(mp_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fusion
    // ─────────────────────────────────────────────────────────────────────────

    /// Fuse `old` into `new`.
    ///
    /// Every keyframe observing `old` is redirected to `new`. A keyframe that
    /// already observes `new` through another feature drops the duplicate
    /// feature instead. `old` is retired and a tombstone keeps `resolve(old)`
    /// pointing at `new`.
    ///
    /// Returns false if either point is missing or they are the same point.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) -> bool {
        if old == new || !self.map_points.contains_key(&new) {
            return false;
        }
        let Some(mut retired) = self.map_points.remove(&old) else {
            return false;
        };

        for (&kf_id, &feature_idx) in &retired.observations {
            let already_observed = self
                .map_points
                .get(&new)
                .map_or(false, |mp| mp.observations.contains_key(&kf_id));

            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                continue;
            };
            if already_observed {
                kf.erase_map_point(feature_idx);
            } else {
                kf.set_map_point(feature_idx, new);
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.add_observation(kf_id, feature_idx);
                }
            }
        }

        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.increase_visible(retired.visible_count);
            mp.increase_found(retired.found_count);
        }

        retired.set_bad();
        retired.replaced_by = Some(new);
        retired.observations.clear();
        self.replaced.insert(old, new);
        self.update_map_point_normal_and_depth(new);
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Get local KeyFrames around a given KeyFrame using covisibility.
    ///
    /// Returns the N KeyFrames with the most shared MapPoints.
    pub fn get_local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.best_covisibles(n))
            .unwrap_or_default()
    }

    /// Get all MapPoints observed by a set of KeyFrames.
    pub fn get_map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> HashSet<MapPointId> {
        let mut mp_ids = HashSet::new();

        for &kf_id in kf_ids {
            if let Some(kf) = self.keyframes.get(&kf_id) {
                for (_, mp_id) in kf.get_map_point_indices() {
                    if self.map_points.get(&mp_id).map_or(false, |mp| !mp.is_bad) {
                        mp_ids.insert(mp_id);
                    }
                }
            }
        }

        mp_ids
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute covisibility of a KeyFrame from its shared observations.
    ///
    /// Edges need [`COVISIBILITY_THRESHOLD`] shared points; when none reach
    /// it the single best neighbour is kept. A KeyFrame connected for the
    /// first time adopts its best neighbour as spanning tree parent.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let counts: HashMap<KeyFrameId, usize> = {
            let Some(kf) = self.keyframes.get(&kf_id) else {
                return;
            };
            let mut counts = HashMap::new();
            for (_, mp_id) in kf.get_map_point_indices() {
                let Some(mp) = self.map_points.get(&mp_id) else {
                    continue;
                };
                if mp.is_bad {
                    continue;
                }
                for &other in mp.observations.keys() {
                    if other != kf_id && self.keyframes.get(&other).map_or(false, |k| !k.is_bad) {
                        *counts.entry(other).or_insert(0) += 1;
                    }
                }
            }
            counts
        };

        if counts.is_empty() {
            return;
        }

        let best = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&id, &w)| (id, w));

        let mut kept: HashMap<KeyFrameId, usize> = counts
            .iter()
            .filter(|(_, &w)| w >= COVISIBILITY_THRESHOLD)
            .map(|(&id, &w)| (id, w))
            .collect();
        if kept.is_empty() {
            if let Some((id, w)) = best {
                kept.insert(id, w);
            }
        }

        let previous: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.get_covisibles().copied().collect())
            .unwrap_or_default();
        for other in previous {
            if !kept.contains_key(&other) {
                if let Some(other_kf) = self.keyframes.get_mut(&other) {
                    other_kf.erase_covisibility(kf_id);
                }
            }
        }
        for (&other, &w) in &kept {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.add_covisibility(kf_id, w);
            }
        }

        let needs_parent = self
            .keyframes
            .get(&kf_id)
            .map_or(false, |kf| kf.first_connection && Some(kf_id) != self.origin_kf);
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_covisibility_weights(kept);
            kf.first_connection = false;
        }
        if needs_parent {
            if let Some((parent, _)) = best {
                self.link_parent(kf_id, parent);
            }
        }
    }

    /// Make `parent` the spanning tree parent of `child`, detaching it from
    /// its previous parent.
    pub fn link_parent(&mut self, child: KeyFrameId, parent: KeyFrameId) {
        if child == parent {
            return;
        }
        let old_parent = self.keyframes.get(&child).and_then(|kf| kf.parent_id);
        if let Some(old) = old_parent {
            if let Some(old_kf) = self.keyframes.get_mut(&old) {
                old_kf.erase_child(child);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&child) {
            kf.set_parent(parent);
        }
        if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
            parent_kf.add_child(child);
        }
    }

    /// Reverse the spanning tree path from `new_root` up to the current root
    /// so that `new_root` has no parent.
    pub fn reroot_spanning_tree(&mut self, new_root: KeyFrameId) {
        let mut path = vec![new_root];
        let mut cursor = new_root;
        while let Some(parent) = self.keyframes.get(&cursor).and_then(|kf| kf.parent_id) {
            if path.contains(&parent) {
                break;
            }
            path.push(parent);
            cursor = parent;
        }
        // Flip edges from the top down so every flip sees a consistent tree.
        for pair in path.windows(2).rev() {
            let (child, parent) = (pair[0], pair[1]);
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.erase_child(child);
                parent_kf.set_parent(child);
            }
            if let Some(child_kf) = self.keyframes.get_mut(&child) {
                child_kf.add_child(parent);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&new_root) {
            kf.parent_id = None;
        }
    }

    /// Express the whole map in a new world frame: `p_new = S * p_old`.
    ///
    /// KeyFrame poses follow the same convention as loop correction, with
    /// the translation rescaled so the rigid pose sees the scaled points.
    pub fn transform_world(&mut self, s_new_old: &Sim3) {
        let s_old_new = s_new_old.inverse();
        for kf in self.keyframes.values_mut() {
            let s_cw_old = Sim3::from_se3(&kf.pose_cw());
            let s_cw_new = s_cw_old.compose(&s_old_new);
            kf.pose = s_cw_new.to_se3_normalized().inverse();
        }
        for mp in self.map_points.values_mut() {
            mp.position = s_new_old.transform_point(&mp.position);
        }
        let ids: Vec<MapPointId> = self.map_points.keys().copied().collect();
        for id in ids {
            self.update_map_point_normal_and_depth(id);
        }
    }

    /// Move every entity of `other` into this map.
    ///
    /// The temporal chains stay separate; the caller links spanning trees.
    pub fn absorb(&mut self, other: Map) {
        self.keyframes.extend(other.keyframes);
        self.map_points.extend(other.map_points);
        self.replaced.extend(other.replaced);
    }

    /// Update the normal and depth bounds for a MapPoint.
    ///
    /// Should be called after the MapPoint's observations or position change.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let positions: Vec<(KeyFrameId, Vector3<f64>)> = self
            .map_points
            .get(&mp_id)
            .map(|mp| {
                mp.observations
                    .keys()
                    .filter_map(|&kf_id| {
                        self.keyframes
                            .get(&kf_id)
                            .map(|kf| (kf_id, kf.camera_center()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if positions.is_empty() {
            return;
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            let positions_ref: Vec<_> = positions.iter().map(|(id, pos)| (id, pos)).collect();
            mp.update_normal_and_depth(
                positions_ref.into_iter(),
                self.orb_scale_factor,
                self.orb_num_levels,
            );
        }
    }

    /// Clear the entire map.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.replaced.clear();
        self.origin_kf = None;
        self.last_keyframe_id = None;
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("id", &self.id)
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .finish()
    }
}
