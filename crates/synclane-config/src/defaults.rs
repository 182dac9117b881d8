//! Default values for client configuration.
//!
//! # Design
//! - Keep protocol constants in one place so the adapter, the synchronizer and
//!   the scheduler agree on them.

/// Maximum number of retries for responses carrying business errors.
pub const MAX_RETRY: u32 = 2;
/// HTTP statuses that are never retried, whatever the body says.
pub const RETRY_BLACKLIST: [u16; 4] = [400, 401, 404, 500];
/// Smallest refresh interval the polling scheduler accepts.
pub const MIN_REFRESH_INTERVAL_MS: u64 = 5_000;
/// Default idle delay before a background refresh.
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 30_000;
/// Hidden-tab duration after which a visible tab refreshes immediately.
pub const BLUR_THRESHOLD_MS: u64 = 60_000;
/// Default per-request network timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default page size for paginated synchronizers.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;
/// Phrases servers use to report an invalidated session.
pub const SESSION_EXPIRY_PHRASES: [&str; 4] = [
    "session timed out",
    "session expired",
    "token expired",
    "invalid token",
];
/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "SYNCLANE_";
