//! Observer channel: an append-only stream of lifecycle events the core
//! publishes for an (out-of-scope) UI or monitoring process to consume.
//! `ListenerSpec` et al. are library types a consumer never reaches into
//! directly — this broadcast channel is the only path out.

use serde::Serialize;
use tokio::sync::broadcast;

/// Per-record-sync outcome, surfaced alongside the attempt count.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced,
    WillRetry { next_attempt_secs: u64 },
    Poisoned { status: u16 },
    TransportError { detail: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    ListenerStateChanged {
        port: u16,
        online: bool,
        client_count: usize,
    },
    MessageIngested {
        port: u16,
        summary: String,
    },
    SyncAttempt {
        result_id: String,
        attempts: u32,
        outcome: SyncOutcome,
    },
    Warning {
        kind: String,
        detail: String,
    },
    Error {
        kind: String,
        detail: String,
    },
}

/// Thin wrapper over `tokio::sync::broadcast`: producers never block, and a
/// receiver that falls behind the default capacity (1024) observes the drop
/// as a `Lagged` error on its next `recv()` rather than the core blocking or
/// buffering unboundedly.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers. A `SendError` only occurs when
    /// there are no subscribers at all, which is a normal, ignorable state.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(Event::Warning {
            kind: "test".into(),
            detail: "hello".into(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Warning { .. }));
    }

    #[tokio::test]
    async fn overflow_is_observed_as_lagged_not_a_panic() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(Event::Warning {
                kind: "test".into(),
                detail: i.to_string(),
            });
        }
        let result = rx.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }
}
