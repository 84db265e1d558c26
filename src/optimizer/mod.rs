//! Optimization module for loop closing and map merging.
//!
//! Implements Levenberg-Marquardt optimization for:
//! - Essential Graph optimization (Sim3 keyframe poses)
//! - Local and global Bundle Adjustment (keyframe poses + map point positions)
//! - Sim3 hypothesis refinement (used during geometric verification)
//!
//! Loop closing talks to map-wide optimization only through [`MapOptimizer`]
//! so that the solver can be swapped.

pub mod bundle_adjustment;
pub mod pose_graph;
pub mod sim3_refinement;

use std::collections::HashSet;

use serde::Deserialize;

use crate::atlas::map::{KeyFrameId, Map};
use crate::geometry::CameraModel;

pub use bundle_adjustment::{
    apply_bundle_result, collect_global_problem, collect_local_problem, solve_bundle_adjustment,
    BundleConfig, BundleObservation, BundleProblem, BundleResult,
};
pub use pose_graph::{EdgeType, EssentialGraphInput, PoseGraphConfig, PoseGraphEdge};
pub use sim3_refinement::{optimize_sim3, Sim3Correspondence, Sim3Refinement};

/// Outcome of an optimization that was applied in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizationSummary {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Keyframes and map points written back.
    pub updated: usize,
}

/// Map-wide optimizations requested by loop closing.
pub trait MapOptimizer: Send + Sync {
    /// Distribute a closure over the Essential Graph of `map` and move map
    /// points with their anchors. The caller holds the map exclusively.
    fn optimize_essential_graph(
        &self,
        map: &mut Map,
        input: &EssentialGraphInput<'_>,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationSummary>;

    /// Bundle adjustment over `window`, with `fixed` and every outside
    /// observer held constant. Applied in place.
    fn local_bundle_adjustment(
        &self,
        map: &mut Map,
        window: &[KeyFrameId],
        fixed: &HashSet<KeyFrameId>,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationSummary>;

    /// Solve a snapshot taken with [`collect_global_problem`]. Runs without
    /// any lock held; the caller applies the result.
    fn global_bundle_adjustment(
        &self,
        problem: &BundleProblem,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<BundleResult>;
}

/// Solver settings for [`DenseOptimizer`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub essential_graph: PoseGraphConfig,
    pub local_ba: BundleConfig,
    pub global_ba: BundleConfig,
}

/// Default [`MapOptimizer`]: dense Levenberg-Marquardt solvers.
pub struct DenseOptimizer {
    camera: CameraModel,
    config: OptimizerConfig,
}

impl DenseOptimizer {
    pub fn new(camera: CameraModel, config: OptimizerConfig) -> Self {
        Self { camera, config }
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }
}

impl MapOptimizer for DenseOptimizer {
    fn optimize_essential_graph(
        &self,
        map: &mut Map,
        input: &EssentialGraphInput<'_>,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationSummary> {
        pose_graph::optimize_essential_graph(map, input, &self.config.essential_graph, should_stop)
    }

    fn local_bundle_adjustment(
        &self,
        map: &mut Map,
        window: &[KeyFrameId],
        fixed: &HashSet<KeyFrameId>,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationSummary> {
        let problem = collect_local_problem(map, window, fixed)?;
        let result = solve_bundle_adjustment(&problem, &self.camera, &self.config.local_ba, should_stop)?;
        let updated = apply_bundle_result(map, &result);

        tracing::debug!(
            window = window.len(),
            iterations = result.iterations,
            "local BA cost {:.4} -> {:.4}",
            result.initial_cost,
            result.final_cost
        );

        Some(OptimizationSummary {
            iterations: result.iterations,
            initial_cost: result.initial_cost,
            final_cost: result.final_cost,
            updated,
        })
    }

    fn global_bundle_adjustment(
        &self,
        problem: &BundleProblem,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<BundleResult> {
        solve_bundle_adjustment(problem, &self.camera, &self.config.global_ba, should_stop)
    }
}
