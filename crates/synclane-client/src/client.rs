//! The `SyncClient` service object: one header table, one cancellation
//! registry, one dedup queue and one session store per client.
//!
//! # Design
//! - Identical concurrent calls share one network round trip through the
//!   dedup queue; each caller still owns a cancellation token.
//! - Business errors (`errors` array) are retried locally up to the policy
//!   limit; every other failure is classified once and propagated.
//! - A session timeout cancels every other pending request, sparing callers
//!   attached to the same fingerprint so they observe the same settle value.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;
use serde_json::Value;
use synclane_config::{ClientConfig, RetryConfig, SessionConfig, validate, validate_base_url};
use synclane_events::{CancelReason, ClientEvent, EventBus, EventStream};
use synclane_telemetry::{Metrics, with_request_context};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{CancellationRegistry, RequestController};
use crate::classify::{classify_response, classify_transport, is_clean_success, should_retry};
use crate::dedup::DedupQueue;
use crate::error::{ClientError, RequestError, StoreResult};
use crate::fingerprint::{RequestFingerprint, fingerprint};
use crate::headers::{HeaderRotator, HeaderTable};
use crate::query::SessionExpiryHandler;
use crate::request::{HeaderMap, Method, OutboundRequest, RequestBody, TransportResponse};
use crate::session::{JsonFileStore, KeyValueStore, MemoryStore, SessionStore};
use crate::transport::{ReqwestTransport, Transport};

/// Header carrying the per-call correlation id.
pub const HEADER_REQUEST_ID: &str = "x-request-id";
const HEADER_AUTHORIZATION: &str = "authorization";

/// Receives the controller for a call before it is sent.
pub type ControllerCallback = Box<dyn FnOnce(RequestController) + Send>;

/// Per-call options.
#[derive(Default)]
pub struct RequestOptions {
    on_controller: Option<ControllerCallback>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("on_controller", &self.on_controller.is_some())
            .finish()
    }
}

impl RequestOptions {
    /// Hand the call's [`RequestController`] to `callback`.
    #[must_use]
    pub fn with_controller(callback: impl FnOnce(RequestController) + Send + 'static) -> Self {
        Self {
            on_controller: Some(Box::new(callback)),
        }
    }
}

/// Builder for [`SyncClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn KeyValueStore>>,
    events: Option<EventBus>,
    metrics: Option<Metrics>,
    rotator: Option<HeaderRotator>,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("custom_transport", &self.transport.is_some())
            .field("custom_store", &self.store.is_some())
            .field("rotator", &self.rotator.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    /// Use `transport` instead of the default `reqwest` transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Persist the session in `store` instead of the configured backend.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish client events on `events`.
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Record metrics in `metrics`.
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Rotate default headers after every clean success.
    #[must_use]
    pub fn rotate_headers(
        mut self,
        rotator: impl Fn(&HeaderMap, &HeaderMap) -> HeaderMap + Send + Sync + 'static,
    ) -> Self {
        self.rotator = Some(Arc::new(rotator));
        self
    }

    /// Validate the configuration and assemble the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the session store
    /// cannot be opened, or the transport/metrics cannot be created.
    pub fn build(self) -> Result<SyncClient, ClientError> {
        validate(&self.config)?;
        let base_url = self
            .config
            .base_url
            .as_deref()
            .map(validate_base_url)
            .transpose()?
            .map(|url| url.as_str().trim_end_matches('/').to_string());

        let store: Arc<dyn KeyValueStore> = match (self.store, &self.config.session.storage_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonFileStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let session = SessionStore::new(store);
        let headers = HeaderTable::load(session.clone())?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.config.request_timeout())?),
        };
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Metrics::new()?,
        };
        let dedup = DedupQueue::new().with_join_hook({
            let metrics = metrics.clone();
            move |_| metrics.inc_dedup_joined()
        });

        info!(
            base_url = base_url.as_deref().unwrap_or("<none>"),
            default_headers = headers.snapshot().len(),
            "synchronization client ready"
        );
        Ok(SyncClient {
            inner: Arc::new(ClientInner {
                transport,
                base_url,
                retry: self.config.retry,
                session_config: self.config.session,
                session,
                headers,
                registry: CancellationRegistry::new(),
                dedup,
                events: self.events.unwrap_or_default(),
                metrics,
                rotator: self.rotator,
                disposed: AtomicBool::new(false),
                session_expired: AtomicBool::new(false),
            }),
        })
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    base_url: Option<String>,
    retry: RetryConfig,
    session_config: SessionConfig,
    session: SessionStore,
    headers: HeaderTable,
    registry: CancellationRegistry,
    dedup: DedupQueue<TransportResponse>,
    events: EventBus,
    metrics: Metrics,
    rotator: Option<HeaderRotator>,
    disposed: AtomicBool,
    session_expired: AtomicBool,
}

/// Request-deduplicating, retrying, session-aware network adapter.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("base_url", &self.inner.base_url)
            .field("pending", &self.pending_requests())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

struct InFlight<'a>(&'a Metrics);

impl<'a> InFlight<'a> {
    fn start(metrics: &'a Metrics) -> Self {
        metrics.request_started();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.request_finished();
    }
}

impl SyncClient {
    /// Start building a client from `config`.
    #[must_use]
    pub const fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            transport: None,
            store: None,
            events: None,
            metrics: None,
            rotator: None,
        }
    }

    /// Build a client with every collaborator derived from `config`.
    ///
    /// # Errors
    ///
    /// See [`ClientBuilder::build`].
    pub fn from_config(config: ClientConfig) -> Result<Self, ClientError> {
        Self::builder(config).build()
    }

    /// Event bus the client publishes on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Metrics registry the client records into.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Persisted session.
    #[must_use]
    pub fn session(&self) -> &SessionStore {
        &self.inner.session
    }

    /// Current default headers.
    #[must_use]
    pub fn default_headers(&self) -> HeaderMap {
        self.inner.headers.snapshot()
    }

    /// Replace the default headers wholesale and persist them.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn set_default_headers(&self, headers: HeaderMap) -> StoreResult<()> {
        self.inner.headers.replace(headers).map(|_| ())
    }

    /// Calls holding a live cancellation token.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    /// Distinct network calls in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.dedup.in_flight()
    }

    /// Whether [`SyncClient::dispose`] was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Send `request`, sharing the round trip with identical calls in flight.
    ///
    /// # Errors
    ///
    /// Returns the classified failure; [`RequestError::Cancelled`] when the
    /// call was aborted or the client is disposed.
    pub async fn request(
        &self,
        request: OutboundRequest,
        options: RequestOptions,
    ) -> Result<TransportResponse, RequestError> {
        if self.is_disposed() {
            return Err(RequestError::Cancelled);
        }
        let label = request.label.clone();
        let prepared = self.prepare(request);
        let fingerprint = fingerprint(&prepared);
        let registered = self.inner.registry.register(Some(fingerprint.clone()));
        if let Some(callback) = options.on_controller {
            callback(registered.controller());
        }
        let token = registered.token().clone();
        if token.is_cancelled() {
            return Err(RequestError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            settled = self
                .inner
                .dedup
                .enqueue(fingerprint.clone(), || self.execute(&prepared, &fingerprint)) => settled,
            () = token.cancelled() => {
                debug!(fingerprint = %fingerprint, "request cancelled by caller");
                Err(RequestError::Cancelled)
            }
        };
        drop(registered);
        outcome.map_err(|error| error.with_label(label.as_deref()))
    }

    /// Send and decode the response body as `T`.
    ///
    /// # Errors
    ///
    /// Returns the request failure, or [`RequestError::Decode`] when the body
    /// does not match `T`.
    pub async fn request_json<T>(
        &self,
        request: OutboundRequest,
        options: RequestOptions,
    ) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
    {
        let label = request.label.clone();
        let response = self.request(request, options).await?;
        serde_json::from_value(response.data.unwrap_or(Value::Null)).map_err(|err| {
            RequestError::Decode {
                message: err.to_string(),
            }
            .with_label(label.as_deref())
        })
    }

    /// `GET` relative to the base URL.
    ///
    /// # Errors
    ///
    /// See [`SyncClient::request`].
    pub async fn get(&self, path: &str) -> Result<TransportResponse, RequestError> {
        self.request(OutboundRequest::get(path), RequestOptions::default())
            .await
    }

    /// `GET` decoded as `T`.
    ///
    /// # Errors
    ///
    /// See [`SyncClient::request_json`].
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        self.request_json(OutboundRequest::get(path), RequestOptions::default())
            .await
    }

    /// `POST` a JSON body relative to the base URL.
    ///
    /// # Errors
    ///
    /// See [`SyncClient::request`].
    pub async fn post(&self, path: &str, body: Value) -> Result<TransportResponse, RequestError> {
        self.request(OutboundRequest::post(path, body), RequestOptions::default())
            .await
    }

    /// `PUT` a JSON body relative to the base URL.
    ///
    /// # Errors
    ///
    /// See [`SyncClient::request`].
    pub async fn put(&self, path: &str, body: Value) -> Result<TransportResponse, RequestError> {
        let request = OutboundRequest::new(Method::Put, path).with_body(RequestBody::Json(body));
        self.request(request, RequestOptions::default()).await
    }

    /// `DELETE` relative to the base URL.
    ///
    /// # Errors
    ///
    /// See [`SyncClient::request`].
    pub async fn delete(&self, path: &str) -> Result<TransportResponse, RequestError> {
        self.request(
            OutboundRequest::new(Method::Delete, path),
            RequestOptions::default(),
        )
        .await
    }

    /// Reload default headers from durable storage after the host window
    /// regains focus.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted headers cannot be read.
    pub fn on_window_focus(&self) -> StoreResult<HeaderMap> {
        let headers = self.inner.headers.reload()?;
        self.inner.events.publish(ClientEvent::HeadersReloaded {
            names: headers.keys().cloned().collect(),
        });
        Ok(headers)
    }

    /// Reload headers on every `WindowFocused` event until the stream closes
    /// or the client is disposed.
    pub async fn run(&self, mut events: EventStream) {
        while let Some(envelope) = events.next().await {
            if self.is_disposed() {
                break;
            }
            if envelope.event != ClientEvent::WindowFocused {
                continue;
            }
            if let Err(err) = self.on_window_focus() {
                warn!(error = %err, "failed to reload persisted headers on focus");
            }
        }
        debug!("client event loop finished");
    }

    /// Clear the persisted session and the in-memory default headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn clear_session(&self) -> StoreResult<()> {
        self.inner.headers.clear();
        self.inner.session.clear_session()
    }

    /// Cancel every pending call. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let count = self.inner.registry.cancel_all();
        self.report_cancelled(count, reason);
        count
    }

    /// Cancel every pending call and reject new ones.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let count = self.cancel_all(CancelReason::ClientDisposed);
        info!(cancelled = count, "synchronization client disposed");
    }

    fn prepare(&self, mut request: OutboundRequest) -> OutboundRequest {
        request.url = self.resolve_url(&request.url);
        let mut headers = self.inner.headers.merged_with(&request.headers);
        if !headers.contains_key(HEADER_AUTHORIZATION) {
            match self.inner.session.token() {
                Ok(Some(token)) => {
                    self.inner.session_expired.store(false, Ordering::Release);
                    headers.insert(HEADER_AUTHORIZATION.to_string(), format!("Bearer {token}"));
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to read persisted auth token"),
            }
        }
        request.headers = headers;
        request
    }

    fn resolve_url(&self, url: &str) -> String {
        let absolute = url.starts_with("http://") || url.starts_with("https://");
        match &self.inner.base_url {
            Some(base) if !absolute => format!("{base}/{}", url.trim_start_matches('/')),
            _ => url.to_string(),
        }
    }

    async fn execute(
        &self,
        request: &OutboundRequest,
        fingerprint: &RequestFingerprint,
    ) -> Result<TransportResponse, RequestError> {
        let request_id = Uuid::new_v4().to_string();
        let mut wire = request.clone();
        wire.headers
            .insert(HEADER_REQUEST_ID.to_string(), request_id.clone());

        with_request_context(request_id, request.label.clone(), async move {
            let mut retries = 0_u32;
            loop {
                let sent = {
                    let _in_flight = InFlight::start(&self.inner.metrics);
                    self.inner.transport.send(&wire).await
                };
                let response = match sent {
                    Ok(response) => response,
                    Err(err) => {
                        self.inner.metrics.inc_http_request(wire.method.as_str(), 0);
                        warn!(method = %wire.method, url = %wire.url, error = %err, "request failed before a response");
                        return Err(classify_transport(&err));
                    }
                };
                self.inner
                    .metrics
                    .inc_http_request(wire.method.as_str(), response.status);

                if should_retry(&response, retries, &self.inner.retry) {
                    retries += 1;
                    self.inner.metrics.inc_retry();
                    info!(
                        method = %wire.method,
                        url = %wire.url,
                        status = response.status,
                        retries,
                        "retrying request after business errors"
                    );
                    continue;
                }
                if is_clean_success(&response) {
                    self.inner.session_expired.store(false, Ordering::Release);
                    self.rotate_headers(&response);
                    return Ok(response);
                }

                let error = classify_response(&response, &self.inner.session_config);
                if error.is_session_timeout() {
                    self.expire_pending(fingerprint);
                }
                debug!(status = response.status, error = %error, "request settled with failure");
                return Err(error);
            }
        })
        .await
    }

    fn rotate_headers(&self, response: &TransportResponse) {
        let Some(rotator) = &self.inner.rotator else {
            return;
        };
        match self.inner.headers.rotate(rotator, &response.headers) {
            Ok(Some(rotated)) => {
                self.inner.events.publish(ClientEvent::HeadersRotated {
                    names: rotated.keys().cloned().collect(),
                });
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to persist rotated headers"),
        }
    }

    fn expire_pending(&self, fingerprint: &RequestFingerprint) {
        self.inner.metrics.inc_session_timeout();
        let count = self.inner.registry.cancel_all_except(fingerprint);
        warn!(cancelled = count, "session timed out; cancelled pending requests");
        self.report_cancelled(count, CancelReason::SessionTimeout);
    }

    fn report_cancelled(&self, count: usize, reason: CancelReason) {
        if count == 0 {
            return;
        }
        self.inner.metrics.add_cancelled(reason.as_str(), count);
        self.inner
            .events
            .publish(ClientEvent::RequestsCancelled { count, reason });
    }
}

/// Callers sharing one expired round trip each report it; only the first
/// clears the session. The latch reopens once a token is attached again or a
/// call succeeds.
impl SessionExpiryHandler for SyncClient {
    fn session_expired(&self, message: &str) {
        if self.inner.session_expired.swap(true, Ordering::AcqRel) {
            debug!("session expiry already handled");
            return;
        }
        if let Err(err) = self.clear_session() {
            warn!(error = %err, "failed to clear persisted session");
        }
        let published = self.inner.events.try_publish(ClientEvent::SessionExpired {
            message: message.to_string(),
        });
        if let Err(err) = published {
            warn!(error = %err, "session expiry was not observed by the host");
        }
    }
}
