//! Validation helpers and parsing utilities for configuration values.

use url::Url;

use crate::defaults::MIN_REFRESH_INTERVAL_MS;
use crate::error::{ConfigError, ConfigResult};
use crate::model::ClientConfig;

const MAX_RETRY_CEILING: u32 = 10;

/// Validate a fully merged configuration document.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] for the first offending field.
pub fn validate(config: &ClientConfig) -> ConfigResult<()> {
    if let Some(base_url) = &config.base_url {
        validate_base_url(base_url)?;
    }
    if config.request_timeout_ms == 0 {
        return Err(invalid(
            "client",
            "request_timeout_ms",
            Some(config.request_timeout_ms.to_string()),
            "must be positive",
        ));
    }
    if config.retry.max_retry > MAX_RETRY_CEILING {
        return Err(invalid(
            "retry",
            "max_retry",
            Some(config.retry.max_retry.to_string()),
            "must not exceed 10",
        ));
    }
    if let Some(status) = config
        .retry
        .blacklist
        .iter()
        .find(|status| !(100..=599).contains(*status))
    {
        return Err(invalid(
            "retry",
            "blacklist",
            Some(status.to_string()),
            "must contain HTTP status codes",
        ));
    }
    if config.polling.refresh_interval_ms < MIN_REFRESH_INTERVAL_MS {
        return Err(invalid(
            "polling",
            "refresh_interval_ms",
            Some(config.polling.refresh_interval_ms.to_string()),
            "below minimum refresh interval",
        ));
    }
    if config.polling.blur_threshold_ms == 0 {
        return Err(invalid(
            "polling",
            "blur_threshold_ms",
            Some("0".to_string()),
            "must be positive",
        ));
    }
    if config.pages.default_limit == 0 {
        return Err(invalid(
            "pages",
            "default_limit",
            Some("0".to_string()),
            "must be positive",
        ));
    }
    if config.telemetry.level.trim().is_empty() {
        return Err(invalid("telemetry", "level", None, "must not be empty"));
    }
    if let Some(format) = &config.telemetry.log_format {
        if !matches!(format.as_str(), "json" | "pretty") {
            return Err(invalid(
                "telemetry",
                "log_format",
                Some(format.clone()),
                "must be json or pretty",
            ));
        }
    }
    Ok(())
}

/// Parse and validate a base URL.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] when the value is not an absolute
/// `http`/`https` URL.
pub fn validate_base_url(value: &str) -> ConfigResult<Url> {
    let url = Url::parse(value).map_err(|_| {
        invalid(
            "client",
            "base_url",
            Some(value.to_string()),
            "must be an absolute URL",
        )
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(
            "client",
            "base_url",
            Some(value.to_string()),
            "must use http or https",
        ));
    }
    Ok(url)
}

/// Interpret common truthy/falsy spellings used in environment variables.
#[must_use]
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a comma-separated list of HTTP status codes.
#[must_use]
pub fn parse_status_list(value: &str) -> Option<Vec<u16>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u16>().ok())
        .collect()
}

fn invalid(
    section: &'static str,
    field: &'static str,
    value: Option<String>,
    reason: &'static str,
) -> ConfigError {
    ConfigError::InvalidField {
        section,
        field,
        value,
        reason,
    }
}
