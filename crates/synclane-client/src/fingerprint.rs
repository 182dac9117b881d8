//! Deterministic request fingerprints used as deduplication keys.
//!
//! # Design
//! - The canonical form sorts object keys recursively so semantically equal
//!   JSON bodies hash identically regardless of construction order.
//! - Binary uploads never hash their bytes; a process-unique nonce takes their
//!   place so two uploads are never merged.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::request::{OutboundRequest, RequestBody};

static NONCE_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Hex-encoded SHA-256 of a request's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint for `request`.
///
/// The label is presentation-only and does not take part.
#[must_use]
pub fn fingerprint(request: &OutboundRequest) -> RequestFingerprint {
    let headers: Map<String, Value> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), Value::String(value.clone())))
        .collect();
    let document = json!({
        "method": request.method.as_str(),
        "url": request.url,
        "headers": headers,
        "body": body_component(&request.body),
    });

    let mut canonical = String::new();
    write_canonical(&document, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    RequestFingerprint(format!("{:x}", hasher.finalize()))
}

fn body_component(body: &RequestBody) -> Value {
    match body {
        RequestBody::Empty => Value::Null,
        RequestBody::Json(value) => json!({ "json": value }),
        RequestBody::Text(text) => json!({ "text": text }),
        RequestBody::Form(fields) => json!({ "form": fields }),
        RequestBody::Binary { .. } => json!({ "binary": binary_nonce() }),
    }
}

fn binary_nonce() -> String {
    let sequence = NONCE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let stamp = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros());
    format!("{stamp}-{sequence}")
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            out.push('{');
            for (index, (key, entry)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(entry, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
