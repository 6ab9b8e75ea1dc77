//! Lifecycle events published by the conductor.
//!
//! Observers subscribe to an [`EventBus`] to follow sequences as they run.
//! Delivery is best effort: a slow receiver lags and misses events, and
//! publishing with no receiver is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Conductor lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ConductorEvent {
    SequenceStarted {
        execution_id: Uuid,
        plugin_id: String,
        sequence_id: String,
        sequence_name: String,
        correlation_id: String,
    },
    BeatStarted {
        execution_id: Uuid,
        sequence_id: String,
        movement: String,
        beat: u32,
        event: String,
        handler: String,
    },
    BeatCompleted {
        execution_id: Uuid,
        sequence_id: String,
        movement: String,
        beat: u32,
        event: String,
        /// Top-level baton keys the beat added, removed or updated.
        changed_keys: Vec<String>,
    },
    BeatFailed {
        execution_id: Uuid,
        sequence_id: String,
        movement: String,
        beat: u32,
        event: String,
        error: String,
    },
    /// A movement stopped early; its remaining beats were skipped.
    MovementFailed {
        execution_id: Uuid,
        sequence_id: String,
        movement: String,
        skipped_beats: usize,
    },
    SequenceCompleted {
        execution_id: Uuid,
        plugin_id: String,
        sequence_id: String,
        correlation_id: String,
        duration_ms: u64,
    },
    SequenceFailed {
        execution_id: Uuid,
        plugin_id: String,
        sequence_id: String,
        correlation_id: String,
        error: String,
    },
    SequenceCancelled {
        execution_id: Uuid,
        plugin_id: String,
        sequence_id: String,
        correlation_id: String,
    },
    /// A topic was published without any route.
    TopicUnrouted { topic: String },
}

/// Broadcast channel for [`ConductorEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConductorEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events. Events emitted before the call are
    /// not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ConductorEvent> {
        self.tx.subscribe()
    }

    /// Emits an event and returns the number of receivers it reached.
    pub fn emit(&self, event: ConductorEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_reaches_nobody() {
        let bus = EventBus::new(4);
        assert_eq!(
            bus.emit(ConductorEvent::TopicUnrouted {
                topic: "nothing".to_string()
            }),
            0
        );
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(ConductorEvent::TopicUnrouted {
            topic: "a".to_string(),
        });
        bus.emit(ConductorEvent::TopicUnrouted {
            topic: "b".to_string(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            ConductorEvent::TopicUnrouted {
                topic: "a".to_string()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ConductorEvent::TopicUnrouted {
                topic: "b".to_string()
            }
        );
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(ConductorEvent::TopicUnrouted {
            topic: "x".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "TopicUnrouted");
        assert_eq!(json["topic"], "x");
    }
}
