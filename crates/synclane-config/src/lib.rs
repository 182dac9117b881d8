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

//! Typed configuration for Synclane synchronization clients.
//!
//! Layout: `model.rs` (typed sections), `defaults.rs` (protocol constants),
//! `validate.rs` (validation/parsing helpers), `loader.rs` (document + env
//! overrides), `error.rs` (error types).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use defaults::{BLUR_THRESHOLD_MS, MAX_RETRY, MIN_REFRESH_INTERVAL_MS, RETRY_BLACKLIST};
pub use error::{ConfigError, ConfigResult};
pub use loader::{CONFIG_PATH_ENV, apply_env_overrides, from_env, load, read_document};
pub use model::{
    ClientConfig, PagesConfig, PollingConfig, RetryConfig, SessionConfig, TelemetryConfig,
};
pub use validate::{validate, validate_base_url};
