//! Geometric verification of common region hypotheses.
//!
//! A BoW candidate becomes a [`Hypothesis`] once a Sim3 between the current
//! keyframe and the candidate's neighbourhood survives RANSAC, refinement
//! and a guided projection search. Every later keyframe re-checks the
//! hypothesis cheaply by chaining its relative pose to the last keyframe
//! that confirmed it ([`GeometricVerifier::advance`]).
//!
//! Convention: `S_cw` maps the matched map's world frame into the current
//! camera frame.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::debug;

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapId, MapPointId};
use crate::atlas::Atlas;
use crate::geometry::{CameraModel, Sim3};
use crate::optimizer::{optimize_sim3, Sim3Correspondence};

use super::detector::RankedCandidate;
use super::matcher::{search_by_bow, search_by_projection, ProjectionParams, NN_RATIO, TH_LOW};
use super::sim3_solver::{compute_sim3_ransac, Sim3Match, Sim3SolverConfig};

/// Thresholds of the verification pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// BoW matches needed before trying RANSAC.
    pub min_bow_matches: usize,
    /// Covisibles of the candidate searched for BoW matches.
    pub bow_window: usize,
    pub sim3: Sim3SolverConfig,
    /// Projection matches needed after the seed search (BoW path).
    pub min_projection_matches: usize,
    /// Inliers needed after Sim3 refinement.
    pub min_refined_inliers: usize,
    /// Projection matches needed after refinement (BoW path).
    pub min_refined_projection_matches: usize,
    /// Projection matches needed after the seed search (incremental path).
    pub min_incremental_projection_matches: usize,
    /// Projection matches needed after refinement (incremental path).
    pub min_incremental_refined_matches: usize,
    pub seed_radius: f64,
    pub refined_radius: f64,
    pub max_projection_hamming: u32,
    /// Refine/project rounds after the seed search.
    pub refinement_rounds: usize,
    pub optimizer_iterations: usize,
    pub refine_chi2: f64,
    /// Coincidences needed to confirm a hypothesis.
    pub required_coincidences: usize,
    /// Consecutive failures after which a hypothesis is dropped.
    pub max_failures: usize,
    /// Covisibles of the current keyframe tried when corroborating.
    pub corroboration_pool: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            min_bow_matches: 20,
            bow_window: 10,
            sim3: Sim3SolverConfig::default(),
            min_projection_matches: 50,
            min_refined_inliers: 20,
            min_refined_projection_matches: 80,
            min_incremental_projection_matches: 30,
            min_incremental_refined_matches: 50,
            seed_radius: 10.0,
            refined_radius: 5.0,
            max_projection_hamming: TH_LOW * 3 / 2,
            refinement_rounds: 3,
            optimizer_iterations: 10,
            refine_chi2: 10.0,
            required_coincidences: 3,
            max_failures: 2,
            corroboration_pool: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Matched region lives in the current map.
    Loop,
    /// Matched region lives in another map.
    Merge,
}

/// Outcome of one successful verification.
#[derive(Debug, Clone)]
pub struct RegionMatch {
    pub matched_kf: KeyFrameId,
    pub s_cw: Sim3,
    /// Map points of the matched keyframe's neighbourhood.
    pub region_points: Vec<MapPointId>,
    /// `(feature of the current keyframe, region point)`.
    pub matches: Vec<(usize, MapPointId)>,
}

/// A common region under observation.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub kind: RegionKind,
    pub matched_kf: KeyFrameId,
    pub matched_map: MapId,
    /// Last keyframe that verified the hypothesis. `s_cw` and `matches` refer
    /// to it.
    pub last_current_kf: KeyFrameId,
    pub s_cw: Sim3,
    pub region_points: Vec<MapPointId>,
    pub matches: Vec<(usize, MapPointId)>,
    pub coincidences: usize,
    pub failures: usize,
}

impl Hypothesis {
    fn update(&mut self, current: KeyFrameId, region: RegionMatch) {
        self.last_current_kf = current;
        self.matched_kf = region.matched_kf;
        self.s_cw = region.s_cw;
        self.region_points = region.region_points;
        self.matches = region.matches;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypothesisStatus {
    Confirmed,
    Pending,
    Abandoned,
}

/// Projection matches of one search, one slot per feature.
struct Projected {
    matched: Vec<Option<MapPointId>>,
    count: usize,
}

impl Projected {
    fn pairs(&self) -> Vec<(usize, MapPointId)> {
        self.matched
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|mp| (idx, mp)))
            .collect()
    }
}

/// Sim3 estimation and projection checks for loop and merge hypotheses.
pub struct GeometricVerifier {
    config: VerifierConfig,
    camera: CameraModel,
    fix_scale: bool,
}

impl GeometricVerifier {
    pub fn new(config: VerifierConfig, camera: CameraModel, fix_scale: bool) -> Self {
        Self {
            config,
            camera,
            fix_scale,
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verify ranked candidates in order and return the first hypothesis
    /// that survives.
    pub fn verify_candidates(
        &self,
        atlas: &Atlas,
        current_kf: KeyFrameId,
        candidates: &[RankedCandidate],
        kind: RegionKind,
    ) -> Option<Hypothesis> {
        candidates
            .iter()
            .find_map(|candidate| self.verify_from_bow(atlas, current_kf, candidate, kind))
    }

    /// Full verification of a BoW candidate.
    ///
    /// The resulting hypothesis starts with as many coincidences as the
    /// current keyframe's covisibles could corroborate. A candidate whose
    /// consistency streak already reached the threshold starts confirmed.
    pub fn verify_from_bow(
        &self,
        atlas: &Atlas,
        current_kf: KeyFrameId,
        candidate: &RankedCandidate,
        kind: RegionKind,
    ) -> Option<Hypothesis> {
        let candidate_kf = candidate.candidate.keyframe_id;
        let current_map = atlas.get_map(atlas.map_of(current_kf)?)?;
        let current = current_map.get_keyframe(current_kf)?;
        let region_map_id = atlas.map_of(candidate_kf)?;
        let region_map = atlas.get_map(region_map_id)?;
        let candidate_frame = region_map.get_keyframe(candidate_kf)?;

        // BoW matches against the candidate and its neighbourhood. Each
        // feature and each region point is used once.
        let mut window = vec![candidate_kf];
        window.extend(candidate_frame.best_covisibles(self.config.bow_window));

        // A neighbourhood reaching back into the current one is not a
        // revisit.
        if window
            .iter()
            .any(|id| *id == current_kf || current.get_covisibility_weight(*id) > 0)
        {
            debug!(kf = %current_kf, candidate = %candidate_kf, "candidate region touches the current keyframe");
            return None;
        }

        let mut bow_matched: Vec<Option<MapPointId>> = vec![None; current.num_features()];
        let mut used: HashSet<MapPointId> = HashSet::new();
        let mut per_keyframe: HashMap<KeyFrameId, usize> = HashMap::new();
        for &kf_id in &window {
            let Some(kf) = region_map.get_keyframe(kf_id).filter(|kf| !kf.is_bad) else {
                continue;
            };
            for (idx, mp_id) in search_by_bow(current_map, current, region_map, kf, NN_RATIO) {
                let Some(slot) = bow_matched.get_mut(idx) else {
                    continue;
                };
                if slot.is_none() && used.insert(mp_id) {
                    *slot = Some(mp_id);
                    *per_keyframe.entry(kf_id).or_insert(0) += 1;
                }
            }
        }

        let num_bow: usize = per_keyframe.values().sum();
        if num_bow < self.config.min_bow_matches {
            debug!(kf = %current_kf, candidate = %candidate_kf, num_bow, "too few BoW matches");
            return None;
        }

        // RANSAC against the keyframe that contributed most matches.
        let (most_kf, _) = per_keyframe
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&id, &n)| (id, n))?;
        let most = region_map.get_keyframe(most_kf)?;
        let t_mw = most.pose_cw();
        let t_cw = current.pose_cw();

        let mut sim3_matches = Vec::new();
        for (idx, slot) in bow_matched.iter().enumerate() {
            let Some(region_mp_id) = slot else {
                continue;
            };
            let Some(region_mp) = region_map.get_map_point(*region_mp_id) else {
                continue;
            };
            let Some(current_mp) = current
                .get_map_point(idx)
                .and_then(|id| current_map.get_map_point(id))
                .filter(|mp| !mp.is_bad)
            else {
                continue;
            };
            let Some(kp) = current.keypoints.get(idx) else {
                continue;
            };

            let p_matched = t_mw.transform_point(&region_mp.position);
            let (uv_matched, inv_sigma2_matched) = match region_mp
                .index_in(most_kf)
                .and_then(|i| most.keypoints.get(i))
            {
                Some(kp_m) => (
                    nalgebra::Vector2::new(kp_m.u, kp_m.v),
                    inv_sigma2(region_map, kp_m.octave),
                ),
                None => match self.camera.project(&p_matched) {
                    Some(uv) => (uv, 1.0),
                    None => continue,
                },
            };

            sim3_matches.push(Sim3Match {
                p_current: t_cw.transform_point(&current_mp.position),
                uv_current: nalgebra::Vector2::new(kp.u, kp.v),
                inv_sigma2_current: inv_sigma2(current_map, kp.octave),
                p_matched,
                uv_matched,
                inv_sigma2_matched,
            });
        }

        let Some(ransac) = compute_sim3_ransac(&sim3_matches, &self.camera, self.fix_scale, &self.config.sim3) else {
            debug!(kf = %current_kf, candidate = %candidate_kf, num_bow, "Sim3 RANSAC failed");
            return None;
        };

        let s_cw = ransac.sim3.compose(&Sim3::from_se3(&t_mw));
        let region_points = self.region_points(region_map, most_kf);
        let region = self.refine(
            current,
            current_map,
            region_map,
            most_kf,
            region_points,
            s_cw,
            self.config.min_projection_matches,
            self.config.min_refined_projection_matches,
        )?;

        let corroborations = self.corroborate(current, current_map, region_map, &region);
        let coincidences = if candidate.promoted {
            corroborations.max(self.config.required_coincidences)
        } else {
            corroborations
        };

        debug!(
            kf = %current_kf,
            matched = %region.matched_kf,
            ransac_inliers = ransac.num_inliers,
            matches = region.matches.len(),
            coincidences,
            ?kind,
            "common region verified"
        );

        Some(Hypothesis {
            kind,
            matched_kf: region.matched_kf,
            matched_map: region_map_id,
            last_current_kf: current_kf,
            s_cw: region.s_cw,
            region_points: region.region_points,
            matches: region.matches,
            coincidences,
            failures: 0,
        })
    }

    /// Re-verify an active hypothesis from a new keyframe of the same map,
    /// seeding the Sim3 with the relative pose to the last verifying keyframe.
    pub fn verify_from_last_kf(
        &self,
        atlas: &Atlas,
        current_kf: KeyFrameId,
        hypothesis: &Hypothesis,
    ) -> Option<RegionMatch> {
        let current_map_id = atlas.map_of(current_kf)?;
        if atlas.map_of(hypothesis.last_current_kf)? != current_map_id {
            return None;
        }
        let current_map = atlas.get_map(current_map_id)?;
        let current = current_map.get_keyframe(current_kf)?;
        let last = current_map
            .get_keyframe(hypothesis.last_current_kf)
            .filter(|kf| !kf.is_bad)?;
        let region_map = atlas.get_map(atlas.map_of(hypothesis.matched_kf)?)?;

        let t_cl = current.pose_cw().compose(&last.pose);
        let s_cw = Sim3::from_se3(&t_cl).compose(&hypothesis.s_cw);
        let region_points = self.region_points(region_map, hypothesis.matched_kf);

        self.refine(
            current,
            current_map,
            region_map,
            hypothesis.matched_kf,
            region_points,
            s_cw,
            self.config.min_incremental_projection_matches,
            self.config.min_incremental_refined_matches,
        )
    }

    /// Fold one incremental verification into the hypothesis counters.
    pub fn advance(&self, atlas: &Atlas, current_kf: KeyFrameId, hypothesis: &mut Hypothesis) -> HypothesisStatus {
        match self.verify_from_last_kf(atlas, current_kf, hypothesis) {
            Some(region) => {
                hypothesis.coincidences += 1;
                hypothesis.failures = 0;
                hypothesis.update(current_kf, region);
                debug!(
                    kf = %current_kf,
                    coincidences = hypothesis.coincidences,
                    kind = ?hypothesis.kind,
                    "hypothesis re-verified"
                );
            }
            None => {
                // The last verifying keyframe stays the seed of the next try.
                hypothesis.failures += 1;
                debug!(
                    kf = %current_kf,
                    failures = hypothesis.failures,
                    kind = ?hypothesis.kind,
                    "hypothesis not re-verified"
                );
                if hypothesis.failures >= self.config.max_failures {
                    return HypothesisStatus::Abandoned;
                }
            }
        }
        self.status(hypothesis)
    }

    pub fn status(&self, hypothesis: &Hypothesis) -> HypothesisStatus {
        if hypothesis.coincidences >= self.config.required_coincidences {
            HypothesisStatus::Confirmed
        } else {
            HypothesisStatus::Pending
        }
    }

    /// Map points seen by `kf_id` and its best covisibles, in id order.
    fn region_points(&self, map: &Map, kf_id: KeyFrameId) -> Vec<MapPointId> {
        let mut window = vec![kf_id];
        window.extend(map.get_local_keyframes(kf_id, self.config.bow_window));
        let mut points: Vec<MapPointId> = map.get_map_points_from_keyframes(&window).into_iter().collect();
        points.sort_unstable();
        points
    }

    /// Seed projection search, then alternate Sim3 refinement and a tighter
    /// projection search while it keeps finding more matches.
    #[allow(clippy::too_many_arguments)]
    fn refine(
        &self,
        current: &KeyFrame,
        current_map: &Map,
        region_map: &Map,
        matched_kf: KeyFrameId,
        region_points: Vec<MapPointId>,
        s_cw: Sim3,
        min_seed: usize,
        min_final: usize,
    ) -> Option<RegionMatch> {
        let seed = self.project(current, &s_cw, region_map, &region_points, self.config.seed_radius);
        if seed.count < min_seed {
            debug!(kf = %current.id, matched = %matched_kf, matches = seed.count, "too few seed projection matches");
            return None;
        }

        let mut estimate = s_cw;
        let mut best = seed;
        for round in 0..self.config.refinement_rounds.max(1) {
            let correspondences = self.correspondences(current, current_map, region_map, &best);
            let refined = optimize_sim3(
                &estimate,
                &correspondences,
                &self.camera,
                self.config.refine_chi2,
                self.config.optimizer_iterations,
            );
            if refined.num_inliers < self.config.min_refined_inliers {
                if round == 0 {
                    debug!(kf = %current.id, inliers = refined.num_inliers, "Sim3 refinement rejected");
                    return None;
                }
                break;
            }

            let again = self.project(current, &refined.s_cw, region_map, &region_points, self.config.refined_radius);
            if round > 0 && again.count <= best.count {
                break;
            }
            estimate = refined.s_cw;
            best = again;
        }

        if best.count < min_final {
            debug!(kf = %current.id, matched = %matched_kf, matches = best.count, "too few refined projection matches");
            return None;
        }

        Some(RegionMatch {
            matched_kf,
            s_cw: estimate,
            region_points,
            matches: best.pairs(),
        })
    }

    /// Count covisibles of the current keyframe that see the region through
    /// the same hypothesis.
    fn corroborate(&self, current: &KeyFrame, current_map: &Map, region_map: &Map, region: &RegionMatch) -> usize {
        let mut corroborations = 0;
        for kf_id in current.best_covisibles(self.config.corroboration_pool) {
            if corroborations >= self.config.required_coincidences {
                break;
            }
            let Some(kf) = current_map.get_keyframe(kf_id).filter(|kf| !kf.is_bad) else {
                continue;
            };
            let t_jc = kf.pose_cw().compose(&current.pose);
            let s_jw = Sim3::from_se3(&t_jc).compose(&region.s_cw);
            let projected = self.project(kf, &s_jw, region_map, &region.region_points, self.config.refined_radius);
            if projected.count >= self.config.min_incremental_projection_matches {
                corroborations += 1;
            }
        }
        corroborations
    }

    fn project(&self, kf: &KeyFrame, s_cw: &Sim3, region_map: &Map, points: &[MapPointId], radius: f64) -> Projected {
        let mut matched = vec![None; kf.num_features()];
        let params = ProjectionParams {
            camera: &self.camera,
            radius,
            max_hamming: self.config.max_projection_hamming,
        };
        let count = search_by_projection(kf, s_cw, region_map, points, &mut matched, &params);
        Projected { matched, count }
    }

    fn correspondences(
        &self,
        current: &KeyFrame,
        current_map: &Map,
        region_map: &Map,
        projected: &Projected,
    ) -> Vec<Sim3Correspondence> {
        projected
            .pairs()
            .into_iter()
            .filter_map(|(idx, mp_id)| {
                let mp = region_map.get_map_point(mp_id)?;
                let kp = current.keypoints.get(idx)?;
                Some(Sim3Correspondence {
                    point_world: mp.position,
                    uv: nalgebra::Vector2::new(kp.u, kp.v),
                    inv_sigma2: inv_sigma2(current_map, kp.octave),
                })
            })
            .collect()
    }
}

fn inv_sigma2(map: &Map, octave: i32) -> f64 {
    let scale = map.scale_factor_at(octave);
    1.0 / (scale * scale)
}
