//! Candidate detection using Bag-of-Words with temporal consistency.
//!
//! For every keyframe the place recognition index is queried for keyframes
//! that look alike but are not already connected to it. Candidates weaker
//! than the keyframe's own neighbourhood are rejected. The survivors are
//! then matched against the consistent groups left by the previous keyframe:
//! a candidate whose neighbourhood overlaps a group extends its streak, any
//! other candidate seeds a new group. Loop candidates (same map) and merge
//! candidates (other maps) keep separate groups.

use std::collections::HashSet;

use serde::Deserialize;
use tracing::debug;

use crate::atlas::keyframe_db::{Candidate, PlaceQuery, PlaceRecognition};
use crate::atlas::map::{KeyFrame, KeyFrameId};
use crate::atlas::Atlas;
use crate::vocabulary::{BowVector, Vocabulary};

/// Configuration for candidate detection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Consecutive keyframes a group must be seen for before promotion.
    pub consistency_threshold: usize,

    /// Loop and merge candidates requested from the index per keyframe.
    pub max_candidates: usize,

    /// Candidates must score at least this fraction of the lowest score
    /// between the keyframe and its covisible neighbours.
    pub min_score_ratio: f64,

    /// Detection is skipped while the current map is smaller than this.
    pub min_keyframes_in_map: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            consistency_threshold: 3,
            max_candidates: 3,
            min_score_ratio: 0.75,
            min_keyframes_in_map: 12,
        }
    }
}

/// A candidate with the streak of the consistent group it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub streak: usize,
    /// The streak reached the consistency threshold.
    pub promoted: bool,
}

/// Candidates found for one keyframe, best first.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub loop_candidates: Vec<RankedCandidate>,
    pub merge_candidates: Vec<RankedCandidate>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.loop_candidates.is_empty() && self.merge_candidates.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ConsistentGroup {
    members: HashSet<KeyFrameId>,
    streak: usize,
}

/// Consistent groups of one kind, replaced on every update.
#[derive(Debug, Default)]
struct ConsistencyTracker {
    groups: Vec<ConsistentGroup>,
}

impl ConsistencyTracker {
    /// Rank `candidates` against the previous groups and keep the new groups.
    fn update(&mut self, candidates: Vec<(Candidate, HashSet<KeyFrameId>)>, threshold: usize) -> Vec<RankedCandidate> {
        let mut next_groups: Vec<ConsistentGroup> = Vec::with_capacity(candidates.len());
        let mut ranked = Vec::with_capacity(candidates.len());

        for (candidate, members) in candidates {
            let streak = self
                .groups
                .iter()
                .filter(|group| !group.members.is_disjoint(&members))
                .map(|group| group.streak + 1)
                .max()
                .unwrap_or(1);

            ranked.push(RankedCandidate {
                candidate,
                streak,
                promoted: streak >= threshold,
            });
            next_groups.push(ConsistentGroup { members, streak });
        }

        self.groups = next_groups;
        ranked.sort_by(|a, b| {
            b.streak
                .cmp(&a.streak)
                .then(b.candidate.score.partial_cmp(&a.candidate.score).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.candidate.keyframe_id.cmp(&b.candidate.keyframe_id))
        });
        ranked
    }

    fn max_streak(&self) -> usize {
        self.groups.iter().map(|g| g.streak).max().unwrap_or(0)
    }

    fn retain_members(&mut self, keep: &dyn Fn(KeyFrameId) -> bool) {
        for group in &mut self.groups {
            group.members.retain(|&kf| keep(kf));
        }
        self.groups.retain(|group| !group.members.is_empty());
    }

    fn clear(&mut self) {
        self.groups.clear();
    }
}

/// Place recognition front end of loop closing.
pub struct CandidateDetector {
    config: DetectorConfig,
    loop_groups: ConsistencyTracker,
    merge_groups: ConsistencyTracker,
}

impl CandidateDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            loop_groups: ConsistencyTracker::default(),
            merge_groups: ConsistencyTracker::default(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Longest streak among the current loop groups.
    pub fn loop_streak(&self) -> usize {
        self.loop_groups.max_streak()
    }

    /// Longest streak among the current merge groups.
    pub fn merge_streak(&self) -> usize {
        self.merge_groups.max_streak()
    }

    /// Query candidates for `kf_id` and update the consistent groups.
    ///
    /// The keyframe itself is not added to the index; the caller does that
    /// once detection for the keyframe is over.
    pub fn detect(
        &mut self,
        kf_id: KeyFrameId,
        atlas: &Atlas,
        place_recognition: &dyn PlaceRecognition,
        vocabulary: &dyn Vocabulary,
    ) -> Detection {
        let Some(map_id) = atlas.map_of(kf_id) else {
            return Detection::default();
        };
        let Some(kf) = atlas.keyframe(kf_id).filter(|kf| !kf.is_bad) else {
            return Detection::default();
        };
        let Some(bow) = kf.bow_vector() else {
            return Detection::default();
        };
        let map_size = atlas.get_map(map_id).map_or(0, |m| m.num_keyframes());
        if map_size < self.config.min_keyframes_in_map {
            debug!(kf = %kf_id, map_size, "map too small for place recognition");
            return Detection::default();
        }

        let excluded = connected_keyframes(kf);
        let min_score = lowest_neighbour_score(atlas, kf, bow, vocabulary) * self.config.min_score_ratio;

        let query = PlaceQuery {
            kf_id,
            map_id,
            bow,
            excluded: &excluded,
        };
        let found = place_recognition.detect_n_best_candidates(&query, atlas, vocabulary, self.config.max_candidates);

        let with_groups = |candidates: Vec<Candidate>| -> Vec<(Candidate, HashSet<KeyFrameId>)> {
            candidates
                .into_iter()
                .filter(|c| raw_score(atlas, c.keyframe_id, bow, vocabulary) >= min_score)
                .filter_map(|c| {
                    let candidate_kf = atlas.keyframe(c.keyframe_id)?;
                    let mut members: HashSet<KeyFrameId> = candidate_kf.get_covisibles().copied().collect();
                    members.insert(c.keyframe_id);
                    Some((c, members))
                })
                .collect()
        };
        let loops = with_groups(found.loop_candidates);
        let merges = with_groups(found.merge_candidates);

        let threshold = self.config.consistency_threshold;
        let detection = Detection {
            loop_candidates: self.loop_groups.update(loops, threshold),
            merge_candidates: self.merge_groups.update(merges, threshold),
        };

        if !detection.is_empty() {
            debug!(
                kf = %kf_id,
                loops = detection.loop_candidates.len(),
                merges = detection.merge_candidates.len(),
                loop_streak = self.loop_streak(),
                merge_streak = self.merge_streak(),
                "place recognition candidates"
            );
        }
        detection
    }

    /// Drop group members that no longer satisfy `keep`.
    pub fn retain_members(&mut self, keep: &dyn Fn(KeyFrameId) -> bool) {
        self.loop_groups.retain_members(keep);
        self.merge_groups.retain_members(keep);
    }

    pub fn reset(&mut self) {
        self.loop_groups.clear();
        self.merge_groups.clear();
    }
}

/// The keyframe, its covisible neighbours and its tree and temporal links.
fn connected_keyframes(kf: &KeyFrame) -> HashSet<KeyFrameId> {
    let mut connected: HashSet<KeyFrameId> = kf.get_covisibles().copied().collect();
    connected.insert(kf.id);
    connected.extend(kf.parent_id);
    connected.extend(kf.children_ids.iter().copied());
    connected.extend(kf.prev_kf);
    connected.extend(kf.next_kf);
    connected
}

/// Lowest BoW score between a keyframe and its covisible neighbours, zero
/// when it has none.
fn lowest_neighbour_score(atlas: &Atlas, kf: &KeyFrame, bow: &BowVector, vocabulary: &dyn Vocabulary) -> f64 {
    kf.get_covisibles()
        .filter_map(|&id| atlas.keyframe(id))
        .filter(|other| !other.is_bad)
        .filter_map(|other| other.bow_vector())
        .map(|other| vocabulary.score(bow, other))
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.min(s))))
        .unwrap_or(0.0)
}

fn raw_score(atlas: &Atlas, kf_id: KeyFrameId, bow: &BowVector, vocabulary: &dyn Vocabulary) -> f64 {
    atlas
        .keyframe(kf_id)
        .and_then(|kf| kf.bow_vector())
        .map_or(0.0, |other| vocabulary.score(bow, other))
}
