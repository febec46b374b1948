//! Notification channel for lifecycle events.
//!
//! Asynchronous operations (hash refresh, storage updates) report back to the
//! presentation layer through this bus rather than through return values.

use serde::Serialize;
use tokio::sync::broadcast;

/// A domain event published when a package version or job changes state.
#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    /// Event type, e.g. "version.deleted", "job.finished"
    #[serde(rename = "type")]
    pub event_type: String,
    /// UUID of the affected version or job
    pub entity_id: String,
    /// Human-readable notice for display
    pub message: Option<String>,
    /// RFC 3339 timestamp
    pub timestamp: String,
}

impl DomainEvent {
    /// Create a domain event timestamped to now.
    pub fn now(
        event_type: impl Into<String>,
        entity_id: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity_id: entity_id.into(),
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Broadcast-based event bus for domain events.
///
/// Subscribers receive events via `tokio::sync::broadcast`. If a subscriber
/// falls behind, it receives `RecvError::Lagged`.
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a domain event. If there are no subscribers the event is dropped silently.
    pub fn publish(&self, event: DomainEvent) {
        tracing::debug!(event_type = %event.event_type, entity_id = %event.entity_id, "Publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to domain events.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}
