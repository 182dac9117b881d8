#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![warn(unused, unreachable_pub)]

//! Telemetry primitives shared across the Synclane workspace.
//!
//! This crate centralises logging, metrics, and request-scoped tracing helpers so the
//! transport adapter and the state machines adopt a consistent observability story.
//! Layout: `init.rs` (subscriber install), `metrics.rs` (Prometheus registry),
//! `context.rs` (task-local request context), `error.rs` (error types).

pub mod context;
pub mod error;
pub mod init;
pub mod metrics;

pub use context::{current_request_id, current_request_label, with_request_context};
pub use error::{Result, TelemetryError};
pub use init::{DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, build_sha, init_logging};
pub use metrics::{Metrics, MetricsSnapshot};
