use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{Session, SessionStatus};

/// Capacity of the event broadcast buffer. Subscribers further behind than
/// this skip ahead.
pub const EVENT_BUFFER: usize = 256;

// ── Event types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    SessionCreated {
        session: Session,
    },
    SessionUpdated {
        session: Session,
    },
    SessionDeleted {
        id: String,
    },
    StatusChanged {
        id: String,
        old: SessionStatus,
        new: SessionStatus,
        session: Session,
    },
}

impl Event {
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionCreated { session } | Self::SessionUpdated { session } => &session.id,
            Self::SessionDeleted { id } | Self::StatusChanged { id, .. } => id,
        }
    }
}

// ── Bus ───────────────────────────────────────────────────────────────

/// Fan-out of lifecycle events. Delivery is at-most-once and nothing is
/// replayed; a client that reconnects lists sessions to catch up.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to every current subscriber. Having none is not an error.
    pub fn publish(&self, event: Event) {
        tracing::debug!(
            session_id = %event.session_id(),
            receivers = self.tx.receiver_count(),
            "publishing event"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone. Events missed by a
    /// lagging subscriber are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged; events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
