//! Canned responses and preconfigured clients.

use std::sync::Arc;

use serde_json::{Value, json};
use synclane_client::{ClientError, SyncClient, Transport, TransportResponse};
use synclane_config::ClientConfig;

/// Base URL every fixture client resolves paths against.
pub const BASE_URL: &str = "https://api.synclane.test";

/// Default configuration pointing at [`BASE_URL`].
#[must_use]
pub fn client_config() -> ClientConfig {
    ClientConfig {
        base_url: Some(BASE_URL.to_string()),
        ..ClientConfig::default()
    }
}

/// Client over `transport` with an in-memory session.
///
/// # Errors
///
/// Returns an error if the client cannot be assembled.
pub fn client(transport: Arc<dyn Transport>) -> Result<SyncClient, ClientError> {
    SyncClient::builder(client_config()).transport(transport).build()
}

/// `200` with a JSON body.
#[must_use]
pub fn ok(data: Value) -> TransportResponse {
    TransportResponse::json(200, data)
}

/// Response whose body carries an `errors` array.
#[must_use]
pub fn business_errors(status: u16, messages: &[&str]) -> TransportResponse {
    let errors: Vec<Value> = messages
        .iter()
        .map(|message| json!({ "message": message }))
        .collect();
    TransportResponse::json(status, json!({ "errors": errors }))
}

/// Bodyless `401`.
#[must_use]
pub fn unauthorized() -> TransportResponse {
    TransportResponse::empty(401)
}
