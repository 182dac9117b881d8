//! Network seam: the [`Transport`] trait and its `reqwest` implementation.
//!
//! # Design
//! - Any received HTTP status is a response; only connection-level failures
//!   are errors. Status interpretation belongs to the client.
//! - Cancellation is handled by the caller dropping the send future.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use synclane_telemetry::{current_request_id, current_request_label};
use thiserror::Error;
use tracing::debug;

use crate::error::ClientError;
use crate::request::{HeaderMap, Method, OutboundRequest, RequestBody, TransportResponse};

/// Connection-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    /// Description of the failure.
    pub message: String,
    /// Whether the failure was a timeout.
    pub timed_out: bool,
}

impl TransportError {
    /// Failure with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Timeout failure.
    #[must_use]
    pub fn timeout() -> Self {
        Self {
            message: "Request timed out".to_string(),
            timed_out: true,
        }
    }
}

/// Performs one network round trip.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request`, whose URL is already absolute.
    ///
    /// # Errors
    ///
    /// Returns an error when no response was received.
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Build a transport with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Transport {
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn map_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::timeout()
    } else {
        TransportError::new(err.to_string())
    }
}

fn decode_body(bytes: &[u8]) -> Option<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(
        serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
    )
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(reqwest_method(request.method), request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Text(text) => builder.body(text.clone()),
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Binary {
                content_type,
                bytes,
                ..
            } => {
                let builder = builder.body(bytes.clone());
                match content_type {
                    Some(kind) if !request.headers.contains_key("content-type") => {
                        builder.header("content-type", kind.as_str())
                    }
                    _ => builder,
                }
            }
        };

        let response = builder.send().await.map_err(|err| map_error(&err))?;
        let status = response.status().as_u16();
        let headers: HeaderMap = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let bytes = response.bytes().await.map_err(|err| map_error(&err))?;
        debug!(
            request_id = current_request_id().as_deref(),
            label = current_request_label().as_deref(),
            method = %request.method,
            url = %request.url,
            status,
            "received response"
        );
        Ok(TransportResponse {
            status,
            headers,
            data: decode_body(&bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bodies_decode_json_then_text() {
        assert_eq!(decode_body(b""), None);
        assert_eq!(decode_body(b"  \n"), None);
        assert_eq!(decode_body(br#"{"ok":true}"#), Some(json!({"ok": true})));
        assert_eq!(decode_body(b"Bad Gateway"), Some(json!("Bad Gateway")));
    }

    #[test]
    fn timeout_errors_are_flagged() {
        let err = TransportError::timeout();
        assert!(err.timed_out);
        assert_eq!(err.to_string(), "Request timed out");
        assert!(!TransportError::new("connection refused").timed_out);
    }
}
