//! Delivery failures reported by the event bus.

use thiserror::Error;

use crate::payloads::EventId;

/// Outcome of a publish that only reached the replay ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventBusError {
    /// Nobody was subscribed when the event was published.
    #[error("{event_kind} event {event_id} reached no live subscriber")]
    NoSubscribers {
        /// Identifier the event was stored under in the replay ring.
        event_id: EventId,
        /// Event kind.
        event_kind: &'static str,
    },
}

/// Result wrapper for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;
