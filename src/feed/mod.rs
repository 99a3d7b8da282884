//! Live feed: push-only event stream for passive subscribers.
//!
//! Three event kinds flow out of a session: completed turns, scheduler
//! state changes, and per-turn metrics updates. Each subscriber gets its
//! own bounded queue; a subscriber that falls behind or disconnects is
//! dropped on the next publish and never blocks the core. Late joiners
//! receive only future events; history lives in the recorder.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::basin::{BasinLabel, CoherencePattern};
use crate::metrics::{AlphaEstimate, IntegrityLabel};
use crate::scheduler::SchedulerState;

/// Trajectory sub-indicators bundled on every metrics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingIndicators {
    pub velocity: Option<f64>,
    pub curvature: Option<f64>,
    /// Running estimate only; the authoritative value arrives with the
    /// Analysis.
    pub alpha: AlphaEstimate,
    pub coherence: CoherencePattern,
}

/// One event on the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    TurnCompleted {
        session_id: Uuid,
        turn_index: usize,
        speaker: String,
        content: String,
        latency: Duration,
    },
    StateChanged {
        session_id: Uuid,
        state: SchedulerState,
        next_speaker: Option<String>,
        /// Set when the transition was forced by a fatal backend failure.
        error: Option<String>,
    },
    MetricsUpdated {
        session_id: Uuid,
        turn_index: usize,
        basin: BasinLabel,
        integrity_label: Option<IntegrityLabel>,
        voice_distinctiveness: Option<f64>,
        coupling: CouplingIndicators,
    },
}

/// Per-session publisher with bounded per-subscriber queues.
pub struct LiveFeed {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<FeedEvent>>>,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber; it sees only events published after this
    /// call.
    pub fn subscribe(&self) -> mpsc::Receiver<FeedEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish to every live subscriber, dropping any whose queue is full
    /// or closed.
    pub fn publish(&self, event: FeedEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("dropping live-feed subscriber: queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Current subscriber count, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
