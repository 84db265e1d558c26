//! Shared state and the seams to the collaborator pipelines.
//!
//! Loop closing never reaches into tracking or local mapping. It holds the
//! shared Atlas through [`SharedState`] and talks to the other threads
//! through the [`LocalMappingControl`] and [`TrackingControl`] traits. The
//! channel based [`PauseHandshake`] is the stock request/acknowledge
//! implementation for local mapping.

pub mod collaborators;
pub mod messages;
pub mod pause;
pub mod shared_state;

pub use collaborators::{LocalMappingControl, TrackingControl};
pub use messages::{ControlAck, ControlRequest};
pub use pause::{acquire_pause, pause_channel, PauseConfig, PauseEndpoint, PauseHandshake, PauseOutcome};
pub use shared_state::SharedState;
