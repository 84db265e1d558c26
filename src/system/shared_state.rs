//! State shared between loop closing and the other pipelines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::atlas::Atlas;

/// Shared state accessible by every pipeline thread.
pub struct SharedState {
    /// The Atlas containing all maps, keyframes, and map points.
    ///
    /// Readers (tracking) take the read lock freely. Bulk writers (loop
    /// closing corrections) only write while local mapping is paused.
    pub atlas: RwLock<Atlas>,

    /// Signal to abort an in-progress local BA. Raised by loop closing when
    /// a pause request is not acknowledged in time.
    pub abort_ba: AtomicBool,
}

impl SharedState {
    /// Create a new SharedState with an empty Atlas.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wrap an existing Atlas.
    pub fn with_atlas(atlas: Atlas) -> Arc<Self> {
        Arc::new(Self {
            atlas: RwLock::new(atlas),
            abort_ba: AtomicBool::new(false),
        })
    }

    /// Check if BA should be aborted.
    pub fn should_abort_ba(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    /// Signal that BA should be aborted.
    pub fn request_abort_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    /// Clear the abort BA flag (after BA completes or is aborted).
    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            atlas: RwLock::new(Atlas::new()),
            abort_ba: AtomicBool::new(false),
        }
    }
}
