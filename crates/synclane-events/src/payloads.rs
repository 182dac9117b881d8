//! Event payload types carried between the client layers.

use chrono::{DateTime, Utc};

/// Identifier assigned to each event emitted by a client.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 256;

/// Why a batch of in-flight requests was cancelled.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The server invalidated the session; remaining calls would fail anyway.
    SessionTimeout,
    /// A paginated synchronizer was reset.
    SynchronizerReset,
    /// The owning client was disposed.
    ClientDisposed,
}

impl CancelReason {
    /// Label used for metrics and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionTimeout => "session_timeout",
            Self::SynchronizerReset => "synchronizer_reset",
            Self::ClientDisposed => "client_disposed",
        }
    }
}

/// Typed events surfaced by the synchronization layer and its host.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// The server rejected the session; hosts should route to a sign-in view.
    SessionExpired {
        /// Human-readable message reported by the server.
        message: String,
    },
    /// A batch of pending requests was cancelled.
    RequestsCancelled {
        /// Number of tokens cancelled.
        count: usize,
        /// Trigger for the cancellation.
        reason: CancelReason,
    },
    /// Default request headers were replaced after a response.
    HeadersRotated {
        /// Header names present after rotation.
        names: Vec<String>,
    },
    /// Default request headers were reloaded from durable storage.
    HeadersReloaded {
        /// Header names present after the reload.
        names: Vec<String>,
    },
    /// The host window regained focus.
    WindowFocused,
    /// The pointer moved inside the host view.
    PointerMoved,
    /// The host tab was hidden or shown.
    VisibilityChanged {
        /// `true` when the tab became hidden.
        hidden: bool,
    },
}

impl ClientEvent {
    /// Machine-friendly discriminator for subscribers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionExpired { .. } => "session_expired",
            Self::RequestsCancelled { .. } => "requests_cancelled",
            Self::HeadersRotated { .. } => "headers_rotated",
            Self::HeadersReloaded { .. } => "headers_reloaded",
            Self::WindowFocused => "window_focused",
            Self::PointerMoved => "pointer_moved",
            Self::VisibilityChanged { .. } => "visibility_changed",
        }
    }

    /// Whether the event is a user-activity signal consumed by the polling scheduler.
    #[must_use]
    pub const fn is_activity(&self) -> bool {
        matches!(
            self,
            Self::PointerMoved | Self::VisibilityChanged { .. } | Self::WindowFocused
        )
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier.
    pub id: EventId,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub event: ClientEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_event_kind(event: &ClientEvent, expected: &str) {
        assert_eq!(event.kind(), expected);
    }

    #[test]
    fn event_kind_maps_variants() {
        assert_event_kind(
            &ClientEvent::SessionExpired {
                message: "Session timed out".into(),
            },
            "session_expired",
        );
        assert_event_kind(
            &ClientEvent::RequestsCancelled {
                count: 2,
                reason: CancelReason::SessionTimeout,
            },
            "requests_cancelled",
        );
        assert_event_kind(
            &ClientEvent::HeadersRotated {
                names: vec!["authorization".into()],
            },
            "headers_rotated",
        );
        assert_event_kind(
            &ClientEvent::HeadersReloaded { names: Vec::new() },
            "headers_reloaded",
        );
        assert_event_kind(&ClientEvent::WindowFocused, "window_focused");
        assert_event_kind(&ClientEvent::PointerMoved, "pointer_moved");
        assert_event_kind(
            &ClientEvent::VisibilityChanged { hidden: true },
            "visibility_changed",
        );
    }

    #[test]
    fn activity_events_are_flagged() {
        assert!(ClientEvent::PointerMoved.is_activity());
        assert!(ClientEvent::VisibilityChanged { hidden: false }.is_activity());
        assert!(
            !ClientEvent::SessionExpired {
                message: String::new()
            }
            .is_activity()
        );
    }

    #[test]
    fn events_serialize_with_type_tag() -> Result<(), serde_json::Error> {
        let json = serde_json::to_value(ClientEvent::VisibilityChanged { hidden: true })?;
        assert_eq!(json["type"], "visibility_changed");
        assert_eq!(json["hidden"], true);

        let cancelled = serde_json::to_value(ClientEvent::RequestsCancelled {
            count: 1,
            reason: CancelReason::SynchronizerReset,
        })?;
        assert_eq!(cancelled["reason"], "synchronizer_reset");
        Ok(())
    }
}
