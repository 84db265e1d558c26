//! Interfaces of the pipelines loop closing coordinates with.

/// Pause/resume control over the local mapping pipeline.
///
/// A correction may only mutate poses and points after `is_paused` has
/// returned true following a `request_pause`.
pub trait LocalMappingControl: Send + Sync {
    /// Ask local mapping to stop after its current work item.
    fn request_pause(&self);

    /// Whether local mapping has acknowledged the pause.
    fn is_paused(&self) -> bool;

    /// Ask local mapping to abandon its current work item (e.g. a local
    /// bundle adjustment) so the pause is acknowledged sooner.
    fn interrupt(&self);

    /// Let local mapping continue.
    fn resume(&self);
}

/// Pause/resume control over the tracking pipeline.
///
/// Tracking tolerates poses changing underneath it, so this is only used
/// around merges, where the set of maps itself changes.
pub trait TrackingControl: Send + Sync {
    fn pause(&self);

    fn resume(&self);
}
