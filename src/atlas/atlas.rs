//! Atlas - multi-map container.
//!
//! The Atlas owns one or more `Map` instances:
//! - One **active** map where Tracking, Local Mapping and Loop Closing operate.
//! - Zero or more **non‑active** maps which may be joined back through map
//!   merging.
//!
//! Ids for keyframes and map points are allocated here, not per map, so a
//! merge can union two arenas without renumbering.

use std::collections::{BTreeMap, HashMap};

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapId, MapPoint, MapPointId};

/// Top‑level multi‑map container.
pub struct Atlas {
    /// All maps managed by the Atlas.
    maps: BTreeMap<MapId, Map>,
    /// The active map. Always a key of `maps`.
    active: MapId,
    /// Which map owns each keyframe.
    kf_owner: HashMap<KeyFrameId, MapId>,
    next_map_id: u64,
    next_kf_id: u64,
    next_mp_id: u64,
}

impl Atlas {
    /// Create a new Atlas with a single empty active map.
    pub fn new() -> Self {
        let first = MapId(0);
        let mut maps = BTreeMap::new();
        maps.insert(first, Map::new(first));

        Self {
            maps,
            active: first,
            kf_owner: HashMap::new(),
            next_map_id: 1,
            next_kf_id: 0,
            next_mp_id: 0,
        }
    }

    /// Number of maps in the Atlas.
    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn map_ids(&self) -> impl Iterator<Item = &MapId> {
        self.maps.keys()
    }

    pub fn active_map_id(&self) -> MapId {
        self.active
    }

    pub fn active_map(&self) -> Option<&Map> {
        self.maps.get(&self.active)
    }

    pub fn active_map_mut(&mut self) -> Option<&mut Map> {
        self.maps.get_mut(&self.active)
    }

    pub fn get_map(&self, id: MapId) -> Option<&Map> {
        self.maps.get(&id)
    }

    pub fn get_map_mut(&mut self, id: MapId) -> Option<&mut Map> {
        self.maps.get_mut(&id)
    }

    /// Create a new empty map and make it the active map.
    pub fn create_new_map(&mut self) -> MapId {
        let id = MapId(self.next_map_id);
        self.next_map_id += 1;
        self.maps.insert(id, Map::new(id));
        self.active = id;
        id
    }

    /// Set the active map. Returns false for an unknown id.
    pub fn set_active_map(&mut self, id: MapId) -> bool {
        if self.maps.contains_key(&id) {
            self.active = id;
            true
        } else {
            false
        }
    }

    /// Drop a map and its ownership records. The last map cannot be removed;
    /// removing the active map activates the lowest remaining id.
    pub fn remove_map(&mut self, id: MapId) -> Option<Map> {
        if self.maps.len() <= 1 {
            return None;
        }
        let removed = self.maps.remove(&id)?;
        self.kf_owner.retain(|_, owner| *owner != id);
        if self.active == id {
            if let Some(&first) = self.maps.keys().next() {
                self.active = first;
            }
        }
        Some(removed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entity allocation and lookup
    // ─────────────────────────────────────────────────────────────────────────

    pub fn allocate_keyframe_id(&mut self) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        id
    }

    pub fn allocate_map_point_id(&mut self) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        id
    }

    /// Insert a keyframe into a map and record its ownership.
    pub fn add_keyframe(&mut self, map_id: MapId, kf: KeyFrame) -> bool {
        let Some(map) = self.maps.get_mut(&map_id) else {
            return false;
        };
        let id = kf.id;
        self.next_kf_id = self.next_kf_id.max(id.0 + 1);
        map.insert_keyframe(kf);
        self.kf_owner.insert(id, map_id);
        true
    }

    pub fn add_map_point(&mut self, map_id: MapId, mp: MapPoint) -> bool {
        let Some(map) = self.maps.get_mut(&map_id) else {
            return false;
        };
        self.next_mp_id = self.next_mp_id.max(mp.id.0 + 1);
        map.add_map_point(mp);
        true
    }

    /// Map that currently owns a keyframe.
    pub fn map_of(&self, kf_id: KeyFrameId) -> Option<MapId> {
        self.kf_owner.get(&kf_id).copied()
    }

    pub fn keyframe(&self, kf_id: KeyFrameId) -> Option<&KeyFrame> {
        self.maps.get(&self.map_of(kf_id)?)?.get_keyframe(kf_id)
    }

    pub fn keyframe_mut(&mut self, kf_id: KeyFrameId) -> Option<&mut KeyFrame> {
        let map_id = self.map_of(kf_id)?;
        self.maps.get_mut(&map_id)?.get_keyframe_mut(kf_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Merging
    // ─────────────────────────────────────────────────────────────────────────

    /// Move every entity of map `from` into map `into` and drop `from`.
    ///
    /// If `from` was active, `into` becomes active.
    pub fn merge_maps(&mut self, into: MapId, from: MapId) -> bool {
        if into == from || !self.maps.contains_key(&into) {
            return false;
        }
        let Some(absorbed) = self.maps.remove(&from) else {
            return false;
        };

        for kf_id in absorbed.keyframe_ids() {
            self.kf_owner.insert(*kf_id, into);
        }
        if let Some(target) = self.maps.get_mut(&into) {
            target.absorb(absorbed);
        }
        if self.active == from {
            self.active = into;
        }
        true
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new()
    }
}
