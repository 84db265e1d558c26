//! Descriptor matching used to verify and weld common regions.
//!
//! - [`search_by_bow`]: features grouped under the same vocabulary node are
//!   compared, with a nearest neighbour ratio test.
//! - [`search_by_projection`]: map points of a region are projected into a
//!   keyframe through a Sim3 hypothesis and matched inside a window scaled by
//!   the predicted pyramid level.
//! - [`fuse`]: like the projection search, but the result is written into
//!   the map: a feature that already has a point gets it replaced by the
//!   region point, a free feature gets a new observation.

use std::collections::HashSet;

use nalgebra::Vector3;
use tracing::debug;

use crate::atlas::map::{descriptor_distance, Descriptor, KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
use crate::geometry::{CameraModel, Sim3, SE3};

/// Strict Hamming threshold for ORB descriptors.
pub const TH_LOW: u32 = 50;
/// Loose Hamming threshold for ORB descriptors.
pub const TH_HIGH: u32 = 100;
/// Nearest neighbour ratio used by the BoW search.
pub const NN_RATIO: f64 = 0.75;

/// Parameters of a projection search.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionParams<'a> {
    pub camera: &'a CameraModel,
    /// Window radius in pixels at pyramid level 0.
    pub radius: f64,
    pub max_hamming: u32,
}

/// Match the map points of `current` to the map points of `other`.
///
/// Returns `(feature index in current, map point of other)`. Each point of
/// `other` is used at most once.
pub fn search_by_bow(
    current_map: &Map,
    current: &KeyFrame,
    other_map: &Map,
    other: &KeyFrame,
    ratio: f64,
) -> Vec<(usize, MapPointId)> {
    let mut matches = Vec::new();
    let mut used: HashSet<usize> = HashSet::new();

    let mut match_group = |current_indices: &[usize], other_indices: &[usize]| {
        for &idx1 in current_indices {
            if !has_live_point(current_map, current, idx1) {
                continue;
            }
            let Some(desc1) = current.descriptors.get(idx1) else {
                continue;
            };

            let mut best = (u32::MAX, None);
            let mut second = u32::MAX;
            for &idx2 in other_indices {
                if used.contains(&idx2) || !has_live_point(other_map, other, idx2) {
                    continue;
                }
                let Some(desc2) = other.descriptors.get(idx2) else {
                    continue;
                };
                let dist = descriptor_distance(desc1, desc2);
                if dist < best.0 {
                    second = best.0;
                    best = (dist, Some(idx2));
                } else if dist < second {
                    second = dist;
                }
            }

            let (best_dist, Some(idx2)) = best else {
                continue;
            };
            if best_dist <= TH_LOW && (best_dist as f64) < ratio * second as f64 {
                if let Some(mp_id) = other.get_map_point(idx2) {
                    used.insert(idx2);
                    matches.push((idx1, mp_id));
                }
            }
        }
    };

    match (current.feature_vector(), other.feature_vector()) {
        (Some(fv1), Some(fv2)) => {
            let mut nodes: Vec<&u32> = fv1.keys().collect();
            nodes.sort_unstable();
            for node in nodes {
                if let (Some(indices1), Some(indices2)) = (fv1.get(node), fv2.get(node)) {
                    match_group(indices1, indices2);
                }
            }
        }
        _ => {
            // No feature vectors: compare every feature against every other.
            let all1: Vec<usize> = (0..current.descriptors.len()).collect();
            let all2: Vec<usize> = (0..other.descriptors.len()).collect();
            match_group(&all1, &all2);
        }
    }

    matches
}

/// Project `points` into `kf` through `s_cw` and extend `matched`.
///
/// `matched` holds one slot per feature of `kf`. Occupied slots and points
/// already present in `matched` are left alone. Returns the number of new
/// matches.
pub fn search_by_projection(
    kf: &KeyFrame,
    s_cw: &Sim3,
    region: &Map,
    points: &[MapPointId],
    matched: &mut [Option<MapPointId>],
    params: &ProjectionParams<'_>,
) -> usize {
    let t_cw = s_cw.to_se3_normalized();
    let center = t_cw.inverse().translation;
    let already: HashSet<MapPointId> = matched.iter().flatten().copied().collect();

    let mut added = 0;
    for &mp_id in points {
        if already.contains(&mp_id) {
            continue;
        }
        let Some(mp) = region.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        let Some((uv, level)) = predict_observation(mp, &t_cw, &center, region, params.camera) else {
            continue;
        };
        let radius = params.radius * region.scale_factor_at(level);

        let best = best_feature(kf, &mp.descriptor, uv.x, uv.y, radius, level, |idx| {
            matched.get(idx).map_or(false, |slot| slot.is_none())
        });
        if let Some((idx, dist)) = best {
            if dist <= params.max_hamming {
                matched[idx] = Some(mp_id);
                added += 1;
            }
        }
    }
    added
}

/// Counts of a [`fuse`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuseStats {
    /// Duplicates retired in favour of a region point.
    pub replaced: usize,
    /// Free features that picked up a region point.
    pub added: usize,
}

/// Fuse region `points` into keyframe `kf_id` seen through `s_cw`.
pub fn fuse(
    map: &mut Map,
    kf_id: KeyFrameId,
    s_cw: &Sim3,
    points: &[MapPointId],
    camera: &CameraModel,
    radius: f64,
) -> FuseStats {
    let t_cw = s_cw.to_se3_normalized();
    let center = t_cw.inverse().translation;
    let mut stats = FuseStats::default();

    for &original in points {
        let Some(mp_id) = map.resolve(original) else {
            continue;
        };

        let decision = {
            let Some(kf) = map.get_keyframe(kf_id) else {
                return stats;
            };
            let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
                continue;
            };
            if mp.observations.contains_key(&kf_id) {
                continue;
            }
            let Some((uv, level)) = predict_observation(mp, &t_cw, &center, map, camera) else {
                continue;
            };
            let window = radius * map.scale_factor_at(level);
            match best_feature(kf, &mp.descriptor, uv.x, uv.y, window, level, |_| true) {
                Some((idx, dist)) if dist <= TH_LOW => Some((idx, kf.get_map_point(idx))),
                _ => None,
            }
        };

        match decision {
            Some((_, Some(existing))) => {
                let existing = map.resolve(existing).unwrap_or(existing);
                if existing != mp_id && map.replace_map_point(existing, mp_id) {
                    stats.replaced += 1;
                }
            }
            Some((idx, None)) => {
                if map.associate(kf_id, idx, mp_id) {
                    stats.added += 1;
                }
            }
            None => {}
        }
    }

    if stats.replaced + stats.added > 0 {
        debug!(
            kf = %kf_id,
            replaced = stats.replaced,
            added = stats.added,
            "fused region points"
        );
    }
    stats
}

/// Projected pixel and predicted pyramid level of a point, or None when the
/// point cannot be seen from the camera at `center`.
fn predict_observation(
    mp: &MapPoint,
    t_cw: &SE3,
    center: &Vector3<f64>,
    map: &Map,
    camera: &CameraModel,
) -> Option<(nalgebra::Vector2<f64>, i32)> {
    let p_cam = t_cw.transform_point(&mp.position);
    let uv = camera.project(&p_cam)?;
    if !camera.is_in_image(&uv) {
        return None;
    }

    let ray = mp.position - center;
    let distance = ray.norm();
    if !mp.is_in_distance_range(distance) {
        return None;
    }
    // Viewing angle under 60 degrees from the mean normal.
    if mp.normal.norm() > 0.0 && ray.dot(&mp.normal) < 0.5 * distance {
        return None;
    }

    let level = mp.predict_scale(distance, map.orb_scale_factor(), map.orb_num_levels());
    Some((uv, level))
}

/// Closest descriptor among the features in the window that pass `accept`.
fn best_feature(
    kf: &KeyFrame,
    descriptor: &Descriptor,
    u: f64,
    v: f64,
    radius: f64,
    level: i32,
    accept: impl Fn(usize) -> bool,
) -> Option<(usize, u32)> {
    kf.get_features_in_area(u, v, radius, Some(level - 1), Some(level + 1))
        .into_iter()
        .filter(|&idx| accept(idx))
        .filter_map(|idx| Some((idx, descriptor_distance(descriptor, kf.descriptors.get(idx)?))))
        .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
}

fn has_live_point(map: &Map, kf: &KeyFrame, idx: usize) -> bool {
    kf.get_map_point(idx)
        .and_then(|mp_id| map.get_map_point(mp_id))
        .map_or(false, |mp| !mp.is_bad)
}
