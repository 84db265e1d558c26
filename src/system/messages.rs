//! Inter-thread message types for the local mapping pause handshake.

/// Request sent from loop closing to local mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Finish the current work item, then hold still until `Resume`.
    Pause,
    /// Continue normal processing.
    Resume,
}

/// Acknowledgement sent back by local mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAck {
    /// Local mapping has stopped touching the map.
    Paused,
    /// Local mapping is running again.
    Resumed,
}
