//! Configuration loading: JSON document, then environment overrides, then validation.
//!
//! # Design
//! - Environment variables are passed in as an iterator so tests never mutate
//!   process state; `from_env` is the only place that reads `std::env`.
//! - A missing document path means "defaults only", never an error.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::defaults::ENV_PREFIX;
use crate::error::{ConfigError, ConfigResult};
use crate::model::ClientConfig;
use crate::validate::{parse_flag, parse_status_list, validate};

/// Environment variable naming an optional JSON configuration document.
pub const CONFIG_PATH_ENV: &str = "SYNCLANE_CONFIG";

/// Load configuration from `SYNCLANE_CONFIG` (if set) and `SYNCLANE_*` overrides.
///
/// # Errors
///
/// Returns an error when the document cannot be read or parsed, when an
/// override is malformed, or when the merged configuration is invalid.
pub fn from_env() -> ConfigResult<ClientConfig> {
    let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    load(path.as_deref(), std::env::vars())
}

/// Load configuration from an optional document and an explicit set of variables.
///
/// # Errors
///
/// See [`from_env`].
pub fn load<I>(path: Option<&Path>, vars: I) -> ConfigResult<ClientConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut config = match path {
        Some(path) => read_document(path)?,
        None => ClientConfig::default(),
    };
    apply_env_overrides(&mut config, vars)?;
    validate(&config)?;
    info!(
        base_url = config.base_url.as_deref().unwrap_or("-"),
        auto_sync = config.polling.auto_sync,
        "client configuration loaded"
    );
    Ok(config)
}

/// Parse a JSON configuration document.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
pub fn read_document(path: &Path) -> ConfigResult<ClientConfig> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        operation: "config.read_document",
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply `SYNCLANE_*` overrides onto `config`. Unknown variables are ignored.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidEnv`] for values that cannot be parsed.
pub fn apply_env_overrides<I>(config: &mut ClientConfig, vars: I) -> ConfigResult<()>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, value) in vars {
        let Some(key) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        match key {
            "BASE_URL" => config.base_url = Some(value.trim().to_string()),
            "REQUEST_TIMEOUT_MS" => config.request_timeout_ms = parse_number(&name, &value)?,
            "MAX_RETRY" => config.retry.max_retry = parse_number(&name, &value)?,
            "RETRY_BLACKLIST" => {
                config.retry.blacklist = parse_status_list(&value)
                    .ok_or_else(|| env_error(&name, &value, "expected comma-separated statuses"))?;
            }
            "SESSION_STORAGE_PATH" => {
                config.session.storage_path = Some(PathBuf::from(value.trim()));
            }
            "AUTO_SYNC" => config.polling.auto_sync = parse_bool(&name, &value)?,
            "REFRESH_INTERVAL_MS" => {
                config.polling.refresh_interval_ms = parse_number(&name, &value)?;
            }
            "BLUR_THRESHOLD_MS" => config.polling.blur_threshold_ms = parse_number(&name, &value)?,
            "PAGE_LIMIT" => config.pages.default_limit = parse_number(&name, &value)?,
            "NEXT_PAGE_ENABLED" => config.pages.next_page_enabled = parse_bool(&name, &value)?,
            "LOG_LEVEL" => config.telemetry.level = value.trim().to_string(),
            "LOG_FORMAT" => config.telemetry.log_format = Some(value.trim().to_ascii_lowercase()),
            _ => {
                debug!(variable = %name, "ignoring unknown configuration override");
                continue;
            }
        }
        debug!(variable = %name, "applied configuration override");
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| env_error(name, value, "expected an unsigned integer"))
}

fn parse_bool(name: &str, value: &str) -> ConfigResult<bool> {
    parse_flag(value).ok_or_else(|| env_error(name, value, "expected a boolean flag"))
}

fn env_error(name: &str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
        reason,
    }
}
