//! Reset and shutdown requests for the loop closing thread.
//!
//! Requests can come from any thread; the loop closing thread consumes them
//! at the top of each iteration.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::atlas::map::MapId;

/// What a pending reset covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    All,
    Maps(HashSet<MapId>),
}

impl ResetScope {
    pub fn covers(&self, map_id: MapId) -> bool {
        match self {
            ResetScope::All => true,
            ResetScope::Maps(maps) => maps.contains(&map_id),
        }
    }
}

#[derive(Debug, Default)]
struct FinishState {
    requested: bool,
    finished: bool,
}

/// Reset and finish flags, each behind its own lock.
#[derive(Debug, Default)]
pub struct Lifecycle {
    reset: Mutex<Option<ResetScope>>,
    finish: Mutex<FinishState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every queued keyframe and hypothesis.
    pub fn request_reset(&self) {
        *self.reset.lock() = Some(ResetScope::All);
    }

    /// Drop what belongs to `map_id` only. Widens, never narrows, a pending
    /// request.
    pub fn request_reset_for_map(&self, map_id: MapId) {
        let mut reset = self.reset.lock();
        match reset.as_mut() {
            Some(ResetScope::All) => {}
            Some(ResetScope::Maps(maps)) => {
                maps.insert(map_id);
            }
            None => *reset = Some(ResetScope::Maps([map_id].into_iter().collect())),
        }
    }

    /// Whether a reset has been requested but not yet processed.
    pub fn reset_pending(&self) -> bool {
        self.reset.lock().is_some()
    }

    /// Consume the pending reset, if any.
    pub fn take_reset(&self) -> Option<ResetScope> {
        self.reset.lock().take()
    }

    pub fn request_finish(&self) {
        self.finish.lock().requested = true;
    }

    pub fn finish_requested(&self) -> bool {
        self.finish.lock().requested
    }

    pub fn set_finished(&self) {
        self.finish.lock().finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finish.lock().finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_resets_accumulate() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.reset_pending());

        lifecycle.request_reset_for_map(MapId(1));
        lifecycle.request_reset_for_map(MapId(3));
        assert!(lifecycle.reset_pending());

        let scope = lifecycle.take_reset().unwrap();
        assert!(scope.covers(MapId(1)));
        assert!(scope.covers(MapId(3)));
        assert!(!scope.covers(MapId(2)));
        assert!(!lifecycle.reset_pending());
        assert_eq!(lifecycle.take_reset(), None);
    }

    #[test]
    fn test_full_reset_absorbs_map_reset() {
        let lifecycle = Lifecycle::new();
        lifecycle.request_reset_for_map(MapId(1));
        lifecycle.request_reset();
        lifecycle.request_reset_for_map(MapId(2));
        assert_eq!(lifecycle.take_reset(), Some(ResetScope::All));
    }

    #[test]
    fn test_finish_is_two_step() {
        let lifecycle = Lifecycle::new();
        lifecycle.request_finish();
        assert!(lifecycle.finish_requested());
        assert!(!lifecycle.is_finished());

        lifecycle.set_finished();
        assert!(lifecycle.is_finished());
    }
}
