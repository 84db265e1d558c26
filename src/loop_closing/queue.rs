//! Keyframe intake queue between local mapping and loop closing.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::atlas::map::KeyFrameId;

/// FIFO of keyframes waiting for loop detection.
///
/// Insertion, draining and reset all go through the same lock, so a reset
/// never interleaves with an insertion.
#[derive(Debug, Default)]
pub struct KeyframeQueue {
    inner: Mutex<VecDeque<KeyFrameId>>,
}

impl KeyframeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kf_id: KeyFrameId) {
        self.inner.lock().push_back(kf_id);
    }

    pub fn has_new(&self) -> bool {
        !self.inner.lock().is_empty()
    }

    /// Oldest queued keyframe.
    pub fn take_next(&self) -> Option<KeyFrameId> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Keep only the keyframes for which `keep` holds. Returns how many were
    /// dropped.
    pub fn retain(&self, mut keep: impl FnMut(KeyFrameId) -> bool) -> usize {
        let mut queue = self.inner.lock();
        let before = queue.len();
        queue.retain(|&kf| keep(kf));
        before - queue.len()
    }
}
