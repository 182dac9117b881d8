//! Typed configuration models for the synchronization client.
//!
//! # Design
//! - Every section has serde defaults so partial documents are valid.
//! - Millisecond fields stay integers on the wire; accessors hand out `Duration`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::{
    BLUR_THRESHOLD_MS, DEFAULT_PAGE_LIMIT, DEFAULT_REFRESH_INTERVAL_MS,
    DEFAULT_REQUEST_TIMEOUT_MS, MAX_RETRY, MIN_REFRESH_INTERVAL_MS, RETRY_BLACKLIST,
    SESSION_EXPIRY_PHRASES,
};

/// Root configuration document for one synchronization client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Base URL relative request paths are resolved against.
    pub base_url: Option<String>,
    /// Per-request network timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Retry policy for business-level errors.
    pub retry: RetryConfig,
    /// Session persistence and expiry detection.
    pub session: SessionConfig,
    /// Activity-aware polling.
    pub polling: PollingConfig,
    /// Paginated synchronizer defaults.
    pub pages: PagesConfig,
    /// Logging configuration.
    pub telemetry: TelemetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            polling: PollingConfig::default(),
            pages: PagesConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Per-request network timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Retry policy for responses carrying an `errors` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt.
    pub max_retry: u32,
    /// Statuses never retried.
    pub blacklist: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: MAX_RETRY,
            blacklist: RETRY_BLACKLIST.to_vec(),
        }
    }
}

impl RetryConfig {
    /// Whether `status` may be retried at all.
    #[must_use]
    pub fn allows_status(&self, status: u16) -> bool {
        !self.blacklist.contains(&status)
    }
}

/// Session persistence and expiry detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Case-insensitive phrases that mark a server message as a session expiry.
    pub expiry_phrases: Vec<String>,
    /// Optional JSON file backing the persisted session; memory-only when absent.
    pub storage_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_phrases: SESSION_EXPIRY_PHRASES
                .iter()
                .map(|phrase| (*phrase).to_string())
                .collect(),
            storage_path: None,
        }
    }
}

impl SessionConfig {
    /// Whether `message` contains one of the configured expiry phrases.
    #[must_use]
    pub fn is_expiry_message(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.expiry_phrases
            .iter()
            .any(|phrase| !phrase.is_empty() && lowered.contains(&phrase.to_lowercase()))
    }
}

/// Activity-aware polling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingConfig {
    /// Whether queries refresh themselves in the background.
    pub auto_sync: bool,
    /// Idle delay before a background refresh.
    pub refresh_interval_ms: u64,
    /// Hidden duration after which a visible tab refreshes immediately.
    pub blur_threshold_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            blur_threshold_ms: BLUR_THRESHOLD_MS,
        }
    }
}

impl PollingConfig {
    /// Idle delay before a background refresh.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Hidden duration after which a visible tab refreshes immediately.
    #[must_use]
    pub const fn blur_threshold(&self) -> Duration {
        Duration::from_millis(self.blur_threshold_ms)
    }

    /// Smallest accepted refresh interval.
    #[must_use]
    pub const fn min_refresh_interval() -> Duration {
        Duration::from_millis(MIN_REFRESH_INTERVAL_MS)
    }
}

/// Paginated synchronizer defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PagesConfig {
    /// Page size used when a load does not specify one.
    pub default_limit: u32,
    /// Whether `load_next_page` is allowed.
    pub next_page_enabled: bool,
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_PAGE_LIMIT,
            next_page_enabled: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Log level or filter directive.
    pub level: String,
    /// `json`, `pretty`, or absent to infer from the build profile.
    pub log_format: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_format: None,
        }
    }
}
