//! KeyFrameDatabase - inverted-index place recognition.
//!
//! Keyframes are indexed by the visual words of their BoW vector. A query
//! collects every keyframe sharing words with the current one, keeps those
//! close to the best word overlap, scores them with the vocabulary and then
//! accumulates scores over covisible neighbourhoods so that a region seen by
//! several keyframes outranks a single lucky match.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::atlas::map::{KeyFrameId, MapId};
use crate::atlas::Atlas;
use crate::vocabulary::{BowVector, Vocabulary};

/// Candidate keyframe with its accumulated neighbourhood score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub map_id: MapId,
    pub score: f64,
}

/// A place recognition query for one keyframe.
pub struct PlaceQuery<'a> {
    pub kf_id: KeyFrameId,
    pub map_id: MapId,
    pub bow: &'a BowVector,
    /// Keyframes never returned, typically the query's covisible set.
    pub excluded: &'a HashSet<KeyFrameId>,
}

/// Candidates split by whether they live in the query's map.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub loop_candidates: Vec<Candidate>,
    pub merge_candidates: Vec<Candidate>,
}

impl CandidateSet {
    pub fn is_empty(&self) -> bool {
        self.loop_candidates.is_empty() && self.merge_candidates.is_empty()
    }
}

/// Place recognition index consulted by loop closing.
pub trait PlaceRecognition: Send + Sync {
    /// Index a keyframe's BoW vector.
    fn add(&self, kf_id: KeyFrameId, map_id: MapId, bow: &BowVector);

    fn erase(&self, kf_id: KeyFrameId);

    /// Drop every keyframe indexed for `map_id`.
    fn clear_map(&self, map_id: MapId);

    /// Re-own every keyframe of `from` to `into` after a merge.
    fn move_map(&self, from: MapId, into: MapId);

    fn clear(&self);

    /// Up to `n` loop candidates (same map) and `n` merge candidates (other maps).
    fn detect_n_best_candidates(
        &self,
        query: &PlaceQuery<'_>,
        atlas: &Atlas,
        vocabulary: &dyn Vocabulary,
        n: usize,
    ) -> CandidateSet;
}

/// Number of covisible neighbours whose scores are accumulated per candidate.
const NEIGHBOURHOOD_SIZE: usize = 10;

/// Candidates must share at least this fraction of the best word overlap.
const MIN_COMMON_WORDS_RATIO: f64 = 0.8;

#[derive(Default)]
struct Index {
    inverted: HashMap<u32, HashSet<KeyFrameId>>,
    bows: HashMap<KeyFrameId, BowVector>,
    owners: HashMap<KeyFrameId, MapId>,
}

impl Index {
    fn remove(&mut self, kf_id: KeyFrameId) {
        self.owners.remove(&kf_id);
        if let Some(bow) = self.bows.remove(&kf_id) {
            for word in bow.keys() {
                if let Some(kfs) = self.inverted.get_mut(word) {
                    kfs.remove(&kf_id);
                }
            }
        }
    }
}

/// Inverted-file keyframe database.
#[derive(Default)]
pub struct KeyFrameDatabase {
    index: RwLock<Index>,
}

impl KeyFrameDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.read().bows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PlaceRecognition for KeyFrameDatabase {
    fn add(&self, kf_id: KeyFrameId, map_id: MapId, bow: &BowVector) {
        let mut index = self.index.write();
        for word in bow.keys() {
            index.inverted.entry(*word).or_default().insert(kf_id);
        }
        index.bows.insert(kf_id, bow.clone());
        index.owners.insert(kf_id, map_id);
    }

    fn erase(&self, kf_id: KeyFrameId) {
        self.index.write().remove(kf_id);
    }

    fn clear_map(&self, map_id: MapId) {
        let mut index = self.index.write();
        let doomed: Vec<KeyFrameId> = index
            .owners
            .iter()
            .filter(|(_, &m)| m == map_id)
            .map(|(&kf, _)| kf)
            .collect();
        for kf_id in doomed {
            index.remove(kf_id);
        }
    }

    fn move_map(&self, from: MapId, into: MapId) {
        for owner in self.index.write().owners.values_mut() {
            if *owner == from {
                *owner = into;
            }
        }
    }

    fn clear(&self) {
        let mut index = self.index.write();
        index.inverted.clear();
        index.bows.clear();
        index.owners.clear();
    }

    fn detect_n_best_candidates(
        &self,
        query: &PlaceQuery<'_>,
        atlas: &Atlas,
        vocabulary: &dyn Vocabulary,
        n: usize,
    ) -> CandidateSet {
        let index = self.index.read();

        // Keyframes sharing words with the query, with their shared word count.
        let mut common_words: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in query.bow.keys() {
            let Some(kfs) = index.inverted.get(word) else {
                continue;
            };
            for &kf_id in kfs {
                if kf_id == query.kf_id || query.excluded.contains(&kf_id) {
                    continue;
                }
                if atlas.keyframe(kf_id).map_or(true, |kf| kf.is_bad) {
                    continue;
                }
                *common_words.entry(kf_id).or_insert(0) += 1;
            }
        }

        let Some(&max_common) = common_words.values().max() else {
            return CandidateSet::default();
        };
        let min_common = (max_common as f64 * MIN_COMMON_WORDS_RATIO) as usize;

        let scores: HashMap<KeyFrameId, f64> = common_words
            .iter()
            .filter(|(_, &words)| words > min_common)
            .filter_map(|(&kf_id, _)| {
                let bow = index.bows.get(&kf_id)?;
                Some((kf_id, vocabulary.score(query.bow, bow)))
            })
            .collect();

        // Accumulate over each candidate's covisible neighbourhood and keep
        // the best scoring keyframe of the group as its representative.
        let mut accumulated: Vec<(f64, KeyFrameId)> = Vec::new();
        for (&kf_id, &score) in &scores {
            let Some(kf) = atlas.keyframe(kf_id) else {
                continue;
            };
            let mut acc = score;
            let mut best = (score, kf_id);
            for neighbour in kf.best_covisibles(NEIGHBOURHOOD_SIZE) {
                if let Some(&s) = scores.get(&neighbour) {
                    acc += s;
                    if s > best.0 || (s == best.0 && neighbour < best.1) {
                        best = (s, neighbour);
                    }
                }
            }
            accumulated.push((acc, best.1));
        }
        accumulated.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let mut result = CandidateSet::default();
        let mut seen = HashSet::new();
        for (score, kf_id) in accumulated {
            if result.loop_candidates.len() >= n && result.merge_candidates.len() >= n {
                break;
            }
            if !seen.insert(kf_id) {
                continue;
            }
            let Some(map_id) = atlas.map_of(kf_id) else {
                continue;
            };
            let candidate = Candidate {
                keyframe_id: kf_id,
                map_id,
                score,
            };
            if map_id == query.map_id {
                if result.loop_candidates.len() < n {
                    result.loop_candidates.push(candidate);
                }
            } else if result.merge_candidates.len() < n {
                result.merge_candidates.push(candidate);
            }
        }
        result
    }
}
