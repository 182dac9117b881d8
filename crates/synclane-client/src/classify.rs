//! Retry decisions and failure classification for settled round trips.

use serde_json::Value;
use synclane_config::{RetryConfig, SessionConfig};

use crate::error::{REQUEST_FAILED_PREFIX, RequestError, SESSION_TIMEOUT_MESSAGE};
use crate::request::TransportResponse;
use crate::transport::TransportError;

const UNAUTHORIZED: u16 = 401;

/// Readable message carried by a response body.
///
/// Priority: string `message`, string-array `message` joined by newlines,
/// then `errors[].message` joined by newlines.
#[must_use]
pub fn extract_message(data: &Value) -> Option<String> {
    match data.get("message") {
        Some(Value::String(message)) if !message.trim().is_empty() => {
            return Some(message.clone());
        }
        Some(Value::Array(lines)) => {
            if let Some(joined) = join_non_empty(lines.iter().filter_map(Value::as_str)) {
                return Some(joined);
            }
        }
        _ => {}
    }
    data.get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| {
            join_non_empty(
                errors
                    .iter()
                    .filter_map(|error| error.get("message").and_then(Value::as_str)),
            )
        })
}

fn join_non_empty<'a>(lines: impl Iterator<Item = &'a str>) -> Option<String> {
    let lines: Vec<&str> = lines.filter(|line| !line.trim().is_empty()).collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Whether `response` should be retried after `retries` previous retries.
#[must_use]
pub fn should_retry(response: &TransportResponse, retries: u32, policy: &RetryConfig) -> bool {
    response.business_errors().is_some()
        && policy.allows_status(response.status)
        && retries < policy.max_retry
}

/// Whether `response` is a clean success.
#[must_use]
pub fn is_clean_success(response: &TransportResponse) -> bool {
    response.is_success() && response.business_errors().is_none()
}

/// Classify a response that is not a clean success.
#[must_use]
pub fn classify_response(response: &TransportResponse, session: &SessionConfig) -> RequestError {
    let status = response.status;
    let message = response
        .data
        .as_ref()
        .filter(|data| !data.is_null())
        .and_then(extract_message);

    let expired = message
        .as_deref()
        .is_some_and(|message| session.is_expiry_message(message));
    if expired || status == UNAUTHORIZED {
        return RequestError::SessionTimeout {
            message: message
                .filter(|_| expired)
                .unwrap_or_else(|| SESSION_TIMEOUT_MESSAGE.to_string()),
        };
    }

    match message {
        Some(message) if response.business_errors().is_some() => {
            RequestError::Business { status, message }
        }
        Some(message) => RequestError::Api { status, message },
        None => RequestError::generic(Some(status)),
    }
}

/// Classify a failure that produced no response.
#[must_use]
pub fn classify_transport(error: &TransportError) -> RequestError {
    let message = error.message.trim();
    if message.is_empty() || message.to_lowercase().starts_with(REQUEST_FAILED_PREFIX) {
        RequestError::generic(None)
    } else {
        RequestError::Transport {
            message: message.to_string(),
        }
    }
}
