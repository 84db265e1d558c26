//! Loop Closing module: loop closure and map merging.
//!
//! This module detects when the camera revisits a mapped region, either in
//! the current map (a loop) or in another map of the atlas (a merge), and
//! removes the accumulated drift.
//!
//! # Architecture
//!
//! The loop closing pipeline consists of:
//! 1. **Intake** (`queue.rs`): keyframes handed over by local mapping
//! 2. **Detection** (`detector.rs`): BoW candidates with consistency checking
//! 3. **Verification** (`verifier.rs`, `sim3_solver.rs`, `matcher.rs`):
//!    Sim3 RANSAC, refinement and guided projection matching
//! 4. **Correction** (`corrector.rs`): pose and point correction, fusion,
//!    Essential Graph optimization and map welding
//! 5. **Global refinement** (`global_refinement.rs`): background Global BA
//! 6. **Thread** (`loop_closer.rs`, `lifecycle.rs`): the main loop, resets
//!    and shutdown
//!
//! # Threading Model
//!
//! The LoopCloser runs in its own thread and mutates the atlas only while
//! local mapping is paused. Global BA uses the three-phase locking pattern:
//! - Phase 1 (COLLECT): Read lock to gather data
//! - Phase 2 (SOLVE): No lock, pure computation
//! - Phase 3 (APPLY): Write lock to update the map

pub mod corrector;
pub mod detector;
pub mod global_refinement;
pub mod lifecycle;
pub mod loop_closer;
pub mod matcher;
pub mod queue;
pub mod sim3_solver;
pub mod verifier;

pub use corrector::{CorrectionKind, CorrectionReport, Corrector, CorrectorConfig};
pub use detector::{CandidateDetector, Detection, DetectorConfig, RankedCandidate};
pub use global_refinement::{LaunchOutcome, RefinementLauncher, RefinementStats};
pub use lifecycle::{Lifecycle, ResetScope};
pub use loop_closer::{LoopCloser, LoopClosingConfig, LoopClosingHandle, LoopClosingStats};
pub use queue::KeyframeQueue;
pub use sim3_solver::{compute_sim3_ransac, Sim3Result, Sim3SolverConfig};
pub use verifier::{GeometricVerifier, Hypothesis, HypothesisStatus, RegionKind, RegionMatch, VerifierConfig};
