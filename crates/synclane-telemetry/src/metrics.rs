//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - One registry per client instance so independent clients (and tests) never
//!   share counters.

use std::sync::Arc;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
    core::Collector,
};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry for one synchronization client.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    http_requests_total: IntCounterVec,
    dedup_joined_total: IntCounter,
    request_retries_total: IntCounter,
    session_timeouts_total: IntCounter,
    requests_cancelled_total: IntCounterVec,
    scheduler_refreshes_total: IntCounterVec,
    requests_in_flight: IntGauge,
}

/// Snapshot of selected gauges and counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Callers that joined an already in-flight identical request.
    pub dedup_joined_total: u64,
    /// Retries issued for business-level errors.
    pub request_retries_total: u64,
    /// Session timeouts observed.
    pub session_timeouts_total: u64,
    /// Network calls currently in flight.
    pub requests_in_flight: i64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be built or
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = register(
            &registry,
            "http_requests_total",
            IntCounterVec::new(
                Opts::new("http_requests_total", "Network calls issued by method and status"),
                &["method", "status"],
            ),
        )?;
        let dedup_joined_total = register(
            &registry,
            "dedup_joined_total",
            IntCounter::with_opts(Opts::new(
                "dedup_joined_total",
                "Callers attached to an identical in-flight request",
            )),
        )?;
        let request_retries_total = register(
            &registry,
            "request_retries_total",
            IntCounter::with_opts(Opts::new(
                "request_retries_total",
                "Retries issued for responses carrying business errors",
            )),
        )?;
        let session_timeouts_total = register(
            &registry,
            "session_timeouts_total",
            IntCounter::with_opts(Opts::new(
                "session_timeouts_total",
                "Responses classified as session timeouts",
            )),
        )?;
        let requests_cancelled_total = register(
            &registry,
            "requests_cancelled_total",
            IntCounterVec::new(
                Opts::new("requests_cancelled_total", "Cancelled requests by trigger"),
                &["reason"],
            ),
        )?;
        let scheduler_refreshes_total = register(
            &registry,
            "scheduler_refreshes_total",
            IntCounterVec::new(
                Opts::new(
                    "scheduler_refreshes_total",
                    "Background refreshes triggered by the polling scheduler",
                ),
                &["trigger"],
            ),
        )?;
        let requests_in_flight = register(
            &registry,
            "requests_in_flight",
            IntGauge::with_opts(Opts::new(
                "requests_in_flight",
                "Network calls currently awaiting a response",
            )),
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                http_requests_total,
                dedup_joined_total,
                request_retries_total,
                session_timeouts_total,
                requests_cancelled_total,
                scheduler_refreshes_total,
                requests_in_flight,
            }),
        })
    }

    /// Count a completed network call for the given method and status.
    ///
    /// Connection-level failures are recorded with status `0`.
    pub fn inc_http_request(&self, method: &str, status: u16) {
        self.inner
            .http_requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
    }

    /// Count a caller that joined an identical in-flight request.
    pub fn inc_dedup_joined(&self) {
        self.inner.dedup_joined_total.inc();
    }

    /// Count a retry issued for a business-level error.
    pub fn inc_retry(&self) {
        self.inner.request_retries_total.inc();
    }

    /// Count a session timeout classification.
    pub fn inc_session_timeout(&self) {
        self.inner.session_timeouts_total.inc();
    }

    /// Count cancelled requests for the given trigger.
    pub fn add_cancelled(&self, reason: &str, count: usize) {
        self.inner
            .requests_cancelled_total
            .with_label_values(&[reason])
            .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
    }

    /// Count a background refresh fired by the polling scheduler.
    pub fn inc_scheduler_refresh(&self, trigger: &str) {
        self.inner
            .scheduler_refreshes_total
            .with_label_values(&[trigger])
            .inc();
    }

    /// Mark a network call as started.
    pub fn request_started(&self) {
        self.inner.requests_in_flight.inc();
    }

    /// Mark a network call as finished.
    pub fn request_finished(&self) {
        self.inner.requests_in_flight.dec();
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dedup_joined_total: self.inner.dedup_joined_total.get(),
            request_retries_total: self.inner.request_retries_total.get(),
            session_timeouts_total: self.inner.session_timeouts_total.get(),
            requests_in_flight: self.inner.requests_in_flight.get(),
        }
    }

    /// Current value of the cancelled-requests counter for one trigger.
    #[must_use]
    pub fn cancelled_count(&self, reason: &str) -> u64 {
        self.inner
            .requests_cancelled_total
            .with_label_values(&[reason])
            .get()
    }

    /// Current value of the scheduler refresh counter for one trigger.
    #[must_use]
    pub fn scheduler_refresh_count(&self, trigger: &str) -> u64 {
        self.inner
            .scheduler_refreshes_total
            .with_label_values(&[trigger])
            .get()
    }
}

fn register<C>(
    registry: &Registry,
    name: &'static str,
    collector: prometheus::Result<C>,
) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    let collector = collector.map_err(|source| TelemetryError::MetricsRegister { name, source })?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })?;
    Ok(collector)
}
