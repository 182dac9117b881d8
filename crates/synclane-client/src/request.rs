//! Outbound request and inbound response models shared by every transport.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Header table keyed by lowercase header name.
pub type HeaderMap = BTreeMap<String, String>;

/// Lowercase every header name, keeping the last value for duplicates.
#[must_use]
pub fn normalize_headers<I, K, V>(headers: I) -> HeaderMap
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    headers
        .into_iter()
        .map(|(name, value)| (name.as_ref().trim().to_ascii_lowercase(), value.into()))
        .collect()
}

/// HTTP verbs understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl Method {
    /// Uppercase wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    /// No body.
    #[default]
    Empty,
    /// JSON document.
    Json(Value),
    /// Plain text.
    Text(String),
    /// URL-encoded form fields.
    Form(BTreeMap<String, String>),
    /// File upload; never merged with another call.
    Binary {
        /// Optional file name reported to the server.
        file_name: Option<String>,
        /// Content type of the payload.
        content_type: Option<String>,
        /// Raw bytes.
        bytes: Vec<u8>,
    },
}

impl RequestBody {
    /// Whether the payload is a binary upload.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary { .. })
    }
}

/// One outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// HTTP verb.
    pub method: Method,
    /// Absolute URL or a path relative to the client's base URL.
    pub url: String,
    /// Request headers, lowercase names.
    pub headers: HeaderMap,
    /// Payload.
    pub body: RequestBody,
    /// Human-readable label prefixed to surfaced error messages.
    pub label: Option<String>,
}

impl OutboundRequest {
    /// Request with no headers and no body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            label: None,
        }
    }

    /// Shorthand for a `GET`.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Shorthand for a `POST` with a JSON body.
    #[must_use]
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, url).with_body(RequestBody::Json(body))
    }

    /// Attach a header; the name is lowercased.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.trim().to_ascii_lowercase(), value.into());
        self
    }

    /// Replace the payload.
    #[must_use]
    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Attach a label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Response returned by a transport for any received HTTP status.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    /// HTTP status.
    pub status: u16,
    /// Response headers, lowercase names.
    pub headers: HeaderMap,
    /// Decoded body; non-JSON text is kept as a JSON string.
    pub data: Option<Value>,
}

impl TransportResponse {
    /// Response with a JSON body and no headers.
    #[must_use]
    pub fn json(status: u16, data: Value) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            data: Some(data),
        }
    }

    /// Response without a body.
    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            data: None,
        }
    }

    /// Attach a header; the name is lowercased.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.trim().to_ascii_lowercase(), value.into());
        self
    }

    /// Whether the status is in the 2xx range.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Non-empty `errors` array carried by the body, if any.
    #[must_use]
    pub fn business_errors(&self) -> Option<&Vec<Value>> {
        self.data
            .as_ref()
            .and_then(|data| data.get("errors"))
            .and_then(Value::as_array)
            .filter(|errors| !errors.is_empty())
    }
}
