//! Error types surfaced by the synchronization layer.
//!
//! # Design
//! - `RequestError` is `Clone` because one settle value fans out to every
//!   waiter attached to a deduplicated request.
//! - Every variant except `Cancelled` carries the human-readable message the
//!   state machines expose as `error_message`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Sentinel message produced by aborted calls; never surfaced to callers.
pub const CANCELLED_MESSAGE: &str = "Request cancelled";
/// Message used when the server invalidates the session without detail.
pub const SESSION_TIMEOUT_MESSAGE: &str = "Session timed out";
/// Fallback message when no better description is available.
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong. Please try again.";
/// Prefix of the boilerplate message transports emit for failed statuses.
pub const REQUEST_FAILED_PREFIX: &str = "request failed";

/// Outcome classification for a failed outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The call was aborted through its cancellation token.
    #[error("Request cancelled")]
    Cancelled,
    /// The server rejected the session.
    #[error("{message}")]
    SessionTimeout {
        /// Message reported by the server or [`SESSION_TIMEOUT_MESSAGE`].
        message: String,
    },
    /// The response carried an `errors` array that survived every retry.
    #[error("{message}")]
    Business {
        /// HTTP status of the final attempt.
        status: u16,
        /// Joined `errors[].message` entries.
        message: String,
    },
    /// The server answered with a failure status and a readable message.
    #[error("{message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },
    /// The call failed before a response arrived.
    #[error("{message}")]
    Transport {
        /// Transport-level description.
        message: String,
    },
    /// Nothing more specific is known.
    #[error("{message}")]
    Generic {
        /// HTTP status when a response arrived.
        status: Option<u16>,
        /// Fallback message.
        message: String,
    },
    /// A successful response could not be decoded into the requested type.
    #[error("{message}")]
    Decode {
        /// Decoder description.
        message: String,
    },
}

impl RequestError {
    /// Whether this is the cancellation sentinel.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the server invalidated the session.
    #[must_use]
    pub const fn is_session_timeout(&self) -> bool {
        matches!(self, Self::SessionTimeout { .. })
    }

    /// HTTP status attached to the failure, when a response arrived.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Business { status, .. } | Self::Api { status, .. } => Some(*status),
            Self::Generic { status, .. } => *status,
            Self::Cancelled | Self::SessionTimeout { .. } | Self::Transport { .. } | Self::Decode { .. } => None,
        }
    }

    /// Fallback error with the generic message.
    #[must_use]
    pub fn generic(status: Option<u16>) -> Self {
        Self::Generic {
            status,
            message: GENERIC_ERROR_MESSAGE.to_string(),
        }
    }

    /// Prefix the human-readable message with a request label.
    ///
    /// Cancellation and session timeouts keep their canonical messages.
    #[must_use]
    pub fn with_label(self, label: Option<&str>) -> Self {
        let Some(label) = label.filter(|label| !label.trim().is_empty()) else {
            return self;
        };
        let prefix = |message: String| format!("{label}: {message}");
        match self {
            Self::Business { status, message } => Self::Business {
                status,
                message: prefix(message),
            },
            Self::Api { status, message } => Self::Api {
                status,
                message: prefix(message),
            },
            Self::Transport { message } => Self::Transport {
                message: prefix(message),
            },
            Self::Generic { status, message } => Self::Generic {
                status,
                message: prefix(message),
            },
            Self::Decode { message } => Self::Decode {
                message: prefix(message),
            },
            other @ (Self::Cancelled | Self::SessionTimeout { .. }) => other,
        }
    }
}

/// Errors raised by durable session storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File system operation failed.
    #[error("session storage io failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
    /// A stored document or value was not valid JSON.
    #[error("session storage payload was not valid json")]
    Json {
        /// Key or file the payload belongs to.
        key: String,
        /// Source serde error.
        source: serde_json::Error,
    },
    /// A typed value did not match its recorded type tag.
    #[error("stored value does not match its type tag")]
    TypeMismatch {
        /// Key the value belongs to.
        key: String,
        /// Recorded type tag.
        tag: String,
    },
}

/// Convenience alias for storage results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while constructing a client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration was invalid.
    #[error("client configuration invalid")]
    Config {
        /// Source configuration error.
        #[from]
        source: synclane_config::ConfigError,
    },
    /// Metrics registry could not be created.
    #[error("client telemetry unavailable")]
    Telemetry {
        /// Source telemetry error.
        #[from]
        source: synclane_telemetry::TelemetryError,
    },
    /// Persisted session could not be read.
    #[error("client session storage unavailable")]
    Store {
        /// Source storage error.
        #[from]
        source: StoreError,
    },
    /// The HTTP transport could not be built.
    #[error("http transport unavailable")]
    Transport {
        /// Transport description.
        message: String,
    },
}
