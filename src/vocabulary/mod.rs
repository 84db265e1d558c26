//! ORB Vocabulary for Bag-of-Words place recognition.
//!
//! A DBoW2 vocabulary is a hierarchical k-means tree over ORB descriptors:
//! - Branching factor k (typically 10)
//! - Depth L levels (typically 5-6)
//! - Leaves are the visual words, each carrying an IDF weight
//!
//! # Key Types
//!
//! - [`BowVector`]: word histogram with TF-IDF weights, L1-normalized
//! - [`FeatureVector`]: feature indices grouped by a tree node a few levels
//!   above the leaves, used to restrict descriptor matching
//! - [`Vocabulary`]: the seam loop closing scores and quantises through
//! - [`OrbVocabulary`]: the tree itself

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::Context;

use crate::atlas::map::{descriptor_distance, Descriptor};

/// Bag-of-Words vector: word_id -> TF-IDF weight.
///
/// The weights are L1-normalized after accumulation.
pub type BowVector = HashMap<u32, f64>;

/// Feature vector: node_id -> list of feature indices.
pub type FeatureVector = HashMap<u32, Vec<usize>>;

/// Similarity scoring, and optionally quantisation, of BoW vectors.
pub trait Vocabulary: Send + Sync {
    /// Score in [0, 1], 1 meaning identical histograms.
    fn score(&self, v1: &BowVector, v2: &BowVector) -> f64;

    /// Turn a keyframe's descriptors into its BoW and feature vectors.
    ///
    /// `None` when this vocabulary cannot quantise, in which case keyframes
    /// must arrive with their vectors already set.
    fn quantize(&self, _descriptors: &[Descriptor]) -> Option<(BowVector, FeatureVector)> {
        None
    }
}

/// Levels above the leaves at which features are grouped.
const FEATURE_LEVELS_UP: usize = 4;

#[derive(Debug, Clone)]
struct Node {
    parent: Option<u32>,
    children: Vec<u32>,
    descriptor: Descriptor,
    /// IDF weight, meaningful on leaves.
    weight: f64,
    word: Option<u32>,
}

/// ORB Vocabulary tree (DBoW2 text format).
#[derive(Debug)]
pub struct OrbVocabulary {
    /// `nodes[0]` is the root.
    nodes: Vec<Node>,
    num_words: usize,
    branching: usize,
    depth: usize,
    feature_levels_up: usize,
}

impl OrbVocabulary {
    /// Load a text vocabulary, naming the file in the error chain.
    ///
    /// ```ignore
    /// let vocab = OrbVocabulary::load("data/ORBvoc.txt")?;
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open vocabulary {}", path.display()))?;
        Self::from_reader(BufReader::new(file)).with_context(|| format!("Failed to load vocabulary {}", path.display()))
    }

    /// Parse a DBoW2 text vocabulary.
    ///
    /// The header line is `k L scoring weighting`; every following line is
    /// one non-root node: `parent is_leaf d0 .. d31 weight`. Nodes are
    /// numbered in file order starting at 1. Short lines are skipped.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, VocabularyError> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .ok_or_else(|| VocabularyError::Parse("empty vocabulary".to_string()))?
            .map_err(|e| VocabularyError::Io(e.to_string()))?;

        let mut fields = header.split_whitespace();
        let branching: usize = parse_field(fields.next(), "k", 1)?;
        let depth: usize = parse_field(fields.next(), "L", 1)?;

        let mut nodes = vec![Node {
            parent: None,
            children: Vec::new(),
            descriptor: [0u8; 32],
            weight: 0.0,
            word: None,
        }];
        let mut num_words = 0u32;

        for (offset, line) in lines.enumerate() {
            let line = line.map_err(|e| VocabularyError::Io(e.to_string()))?;
            let line_no = offset + 2;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 35 {
                continue;
            }

            let parent: u32 = parse_field(Some(parts[0]), "parent", line_no)?;
            let mut descriptor = [0u8; 32];
            for (byte, text) in descriptor.iter_mut().zip(&parts[2..34]) {
                *byte = parse_field(Some(*text), "descriptor byte", line_no)?;
            }
            let weight: f64 = parse_field(Some(parts[34]), "weight", line_no)?;

            let id = nodes.len() as u32;
            let word = (parts[1] == "1").then(|| {
                num_words += 1;
                num_words - 1
            });
            match nodes.get_mut(parent as usize) {
                Some(parent_node) => parent_node.children.push(id),
                None => {
                    return Err(VocabularyError::Parse(format!(
                        "line {line_no}: parent {parent} defined after its child"
                    )))
                }
            }
            nodes.push(Node {
                parent: Some(parent),
                children: Vec::new(),
                descriptor,
                weight,
                word,
            });
        }

        tracing::info!(k = branching, l = depth, nodes = nodes.len(), words = num_words, "vocabulary loaded");

        Ok(Self {
            nodes,
            num_words: num_words as usize,
            branching,
            depth,
            feature_levels_up: FEATURE_LEVELS_UP.min(depth.saturating_sub(1)),
        })
    }

    /// `(k, L)` from the header.
    pub fn params(&self) -> (usize, usize) {
        (self.branching, self.depth)
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Descend to the leaf closest to `desc`. Returns `(word, leaf node)`.
    fn descend(&self, desc: &Descriptor) -> (u32, u32) {
        let mut node = 0u32;
        while let Some(next) = self.nodes[node as usize]
            .children
            .iter()
            .copied()
            .min_by_key(|&child| (descriptor_distance(desc, &self.nodes[child as usize].descriptor), child))
        {
            node = next;
        }
        (self.nodes[node as usize].word.unwrap_or(0), node)
    }

    /// Quantize a single descriptor to its visual word.
    pub fn word_of(&self, desc: &Descriptor) -> u32 {
        self.descend(desc).0
    }

    /// Ancestor `levels_up` steps above `node`, stopping at the root.
    fn ancestor(&self, mut node: u32, levels_up: usize) -> u32 {
        for _ in 0..levels_up {
            match self.nodes[node as usize].parent {
                Some(parent) => node = parent,
                None => break,
            }
        }
        node
    }

    /// BoW vector and feature vector of a set of descriptors, grouping
    /// features `levels_up` levels above their leaf.
    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut features = FeatureVector::new();

        for (idx, desc) in descriptors.iter().enumerate() {
            let (word, leaf) = self.descend(desc);
            *bow.entry(word).or_insert(0.0) += self.nodes[leaf as usize].weight;
            features.entry(self.ancestor(leaf, levels_up)).or_default().push(idx);
        }

        let total: f64 = bow.values().sum();
        if total > 0.0 {
            bow.values_mut().for_each(|w| *w /= total);
        }
        (bow, features)
    }
}

impl Vocabulary for OrbVocabulary {
    fn score(&self, v1: &BowVector, v2: &BowVector) -> f64 {
        l1_score(v1, v2)
    }

    fn quantize(&self, descriptors: &[Descriptor]) -> Option<(BowVector, FeatureVector)> {
        Some(self.transform(descriptors, self.feature_levels_up))
    }
}

/// L1 scoring without a loaded tree, for callers that receive precomputed
/// BoW vectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct L1Scoring;

impl Vocabulary for L1Scoring {
    fn score(&self, v1: &BowVector, v2: &BowVector) -> f64 {
        l1_score(v1, v2)
    }
}

/// `1 - 0.5 * |v1 - v2|_1` over L1-normalized vectors.
pub fn l1_score(v1: &BowVector, v2: &BowVector) -> f64 {
    let shared: f64 = v1
        .iter()
        .map(|(word, w1)| (w1 - v2.get(word).copied().unwrap_or(0.0)).abs())
        .sum();
    let only_in_v2: f64 = v2.iter().filter(|(word, _)| !v1.contains_key(word)).map(|(_, w)| w.abs()).sum();
    1.0 - 0.5 * (shared + only_in_v2)
}

fn parse_field<T: std::str::FromStr>(text: Option<&str>, what: &str, line_no: usize) -> Result<T, VocabularyError> {
    text.and_then(|t| t.parse().ok())
        .ok_or_else(|| VocabularyError::Parse(format!("line {line_no}: invalid {what}")))
}

/// Errors that can occur when loading a vocabulary.
#[derive(Debug)]
pub enum VocabularyError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for VocabularyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VocabularyError::Io(msg) => write!(f, "Vocabulary I/O error: {}", msg),
            VocabularyError::Parse(msg) => write!(f, "Vocabulary parse error: {}", msg),
        }
    }
}

impl std::error::Error for VocabularyError {}
