//! Request/acknowledge pause handshake with local mapping.
//!
//! Loop closing sends [`ControlRequest::Pause`] and waits for
//! [`ControlAck::Paused`]. Waiting is bounded per attempt; after a few
//! unanswered attempts the request escalates by raising the shared
//! `abort_ba` flag so local mapping drops its current bundle adjustment.
//! The wait only gives up when the caller is shutting down, so a correction
//! never runs against an unpaused map.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::Deserialize;
use tracing::{debug, warn};

use super::collaborators::LocalMappingControl;
use super::messages::{ControlAck, ControlRequest};
use super::shared_state::SharedState;

/// Timing of the pause handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PauseConfig {
    /// How long one attempt waits for the acknowledgement.
    pub attempt_timeout_ms: u64,
    /// Unanswered attempts before interrupting local mapping's work.
    pub escalate_after: u32,
    /// Poll period while waiting.
    pub poll_interval_ms: u64,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 50,
            escalate_after: 3,
            poll_interval_ms: 1,
        }
    }
}

/// Result of [`acquire_pause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// Local mapping is paused; the caller must resume it when done.
    Paused { attempts: u32, escalated: bool },
    /// The caller asked to give up (shutdown). Nothing may be mutated.
    Abandoned,
}

/// Pause local mapping, retrying with escalation until it acknowledges or
/// `should_abandon` returns true.
pub fn acquire_pause(
    control: &dyn LocalMappingControl,
    config: &PauseConfig,
    should_abandon: &dyn Fn() -> bool,
) -> PauseOutcome {
    let attempt_timeout = Duration::from_millis(config.attempt_timeout_ms);
    let poll = Duration::from_millis(config.poll_interval_ms.max(1));

    control.request_pause();

    let mut attempts = 0u32;
    let mut escalated = false;
    loop {
        attempts += 1;
        let deadline = Instant::now() + attempt_timeout;
        while Instant::now() < deadline {
            if control.is_paused() {
                debug!(attempts, escalated, "local mapping paused");
                return PauseOutcome::Paused {
                    attempts,
                    escalated,
                };
            }
            thread::sleep(poll);
        }

        if should_abandon() {
            warn!(attempts, "abandoning local mapping pause");
            control.resume();
            return PauseOutcome::Abandoned;
        }

        if !escalated && attempts >= config.escalate_after {
            warn!(attempts, "local mapping did not pause, interrupting its work");
            control.interrupt();
            escalated = true;
        } else {
            debug!(attempts, "waiting for local mapping to pause");
        }
    }
}

/// Create a connected requester/endpoint pair.
///
/// The [`PauseHandshake`] goes to loop closing, the [`PauseEndpoint`] to the
/// local mapping thread.
pub fn pause_channel(shared: &Arc<SharedState>) -> (PauseHandshake, PauseEndpoint) {
    let (request_tx, request_rx) = unbounded();
    let (ack_tx, ack_rx) = unbounded();
    (
        PauseHandshake {
            requests: request_tx,
            acks: ack_rx,
            paused: AtomicBool::new(false),
            shared: Arc::clone(shared),
        },
        PauseEndpoint {
            requests: request_rx,
            acks: ack_tx,
            shared: Arc::clone(shared),
        },
    )
}

/// Loop closing side of the handshake.
pub struct PauseHandshake {
    requests: Sender<ControlRequest>,
    acks: Receiver<ControlAck>,
    paused: AtomicBool,
    shared: Arc<SharedState>,
}

impl LocalMappingControl for PauseHandshake {
    fn request_pause(&self) {
        // A disconnected endpoint never acknowledges; the caller's retry
        // loop reports it.
        let _ = self.requests.send(ControlRequest::Pause);
    }

    fn is_paused(&self) -> bool {
        for ack in self.acks.try_iter() {
            self.paused
                .store(ack == ControlAck::Paused, Ordering::SeqCst);
        }
        self.paused.load(Ordering::SeqCst)
    }

    fn interrupt(&self) {
        self.shared.request_abort_ba();
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _ = self.requests.send(ControlRequest::Resume);
    }
}

/// Local mapping side of the handshake.
pub struct PauseEndpoint {
    requests: Receiver<ControlRequest>,
    acks: Sender<ControlAck>,
    shared: Arc<SharedState>,
}

impl PauseEndpoint {
    /// Serve a pending pause request, blocking until resumed.
    ///
    /// Call between work items. Returns true if the thread was paused.
    pub fn service(&self) -> bool {
        match self.requests.try_recv() {
            Ok(ControlRequest::Pause) => {
                self.hold();
                true
            }
            Ok(ControlRequest::Resume) | Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => false,
        }
    }

    /// Whether the current work item should be dropped.
    pub fn should_abort_work(&self) -> bool {
        self.shared.should_abort_ba()
    }

    fn hold(&self) {
        self.shared.clear_abort_ba();
        if self.acks.send(ControlAck::Paused).is_err() {
            return;
        }
        loop {
            match self.requests.recv() {
                Ok(ControlRequest::Pause) => continue,
                Ok(ControlRequest::Resume) | Err(_) => break,
            }
        }
        let _ = self.acks.send(ControlAck::Resumed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> PauseConfig {
        PauseConfig {
            attempt_timeout_ms: 10,
            escalate_after: 2,
            poll_interval_ms: 1,
        }
    }

    #[test]
    fn test_pause_and_resume_round_trip() {
        let shared = SharedState::new();
        let (handshake, endpoint) = pause_channel(&shared);
        let stop = Arc::new(AtomicBool::new(false));
        let pauses = Arc::new(AtomicUsize::new(0));

        let worker = {
            let stop = Arc::clone(&stop);
            let pauses = Arc::clone(&pauses);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if endpoint.service() {
                        pauses.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let outcome = acquire_pause(&handshake, &fast_config(), &|| false);
        assert!(matches!(outcome, PauseOutcome::Paused { .. }));
        assert!(handshake.is_paused());

        handshake.resume();
        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();
        assert_eq!(pauses.load(Ordering::SeqCst), 1);
        assert!(!handshake.is_paused());
    }

    #[test]
    fn test_busy_local_mapping_is_interrupted() {
        let shared = SharedState::new();
        let (handshake, endpoint) = pause_channel(&shared);

        // Simulates a long local BA that only yields when told to abort.
        let worker = thread::spawn(move || {
            while !endpoint.should_abort_work() {
                thread::sleep(Duration::from_millis(1));
            }
            endpoint.service()
        });

        let outcome = acquire_pause(&handshake, &fast_config(), &|| false);
        assert!(matches!(
            outcome,
            PauseOutcome::Paused {
                escalated: true,
                ..
            }
        ));
        handshake.resume();
        assert!(worker.join().unwrap());
        assert!(!shared.should_abort_ba());
    }

    #[test]
    fn test_unresponsive_local_mapping_abandoned_on_shutdown() {
        let shared = SharedState::new();
        let (handshake, _endpoint) = pause_channel(&shared);
        let outcome = acquire_pause(&handshake, &fast_config(), &|| true);
        assert_eq!(outcome, PauseOutcome::Abandoned);
    }
}
