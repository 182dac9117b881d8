//! Loading/loaded/error state machine around one async operation.
//!
//! # Design
//! - State is published through a `watch` channel; observers always see the
//!   latest snapshot.
//! - Writes after [`Query::unmount`] are dropped.
//! - Cancellation is never surfaced; polling failures are swallowed; session
//!   expiry is handed to a [`SessionExpiryHandler`] instead of the error slot.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::RequestError;

/// Reacts to a server-side session invalidation.
pub trait SessionExpiryHandler: Send + Sync {
    /// Clear local identity and notify the host.
    fn session_expired(&self, message: &str);
}

/// Forward session timeouts in `result` to `handler`; the result is returned unchanged.
pub(crate) fn intercept_session<T>(
    handler: Option<&dyn SessionExpiryHandler>,
    result: Result<T, RequestError>,
) -> Result<T, RequestError> {
    if let Err(RequestError::SessionTimeout { message }) = &result {
        match handler {
            Some(handler) => handler.session_expired(message),
            None => warn!(message = %message, "session expired with no handler attached"),
        }
    }
    result
}

/// Whether a failure should land in `error_message`.
pub(crate) const fn records_error(error: &RequestError, is_polling: bool) -> bool {
    !is_polling && !error.is_cancelled() && !error.is_session_timeout()
}

/// Observable query state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryState<T> {
    /// A load is in flight.
    pub loading: bool,
    /// At least one load succeeded since the last reset.
    pub loaded: bool,
    /// Message of the last foreground failure.
    pub error_message: Option<String>,
    /// Last successful result, or the initial value.
    pub record: T,
}

impl<T> QueryState<T> {
    /// Idle state holding `record`.
    #[must_use]
    pub const fn idle(record: T) -> Self {
        Self {
            loading: false,
            loaded: false,
            error_message: None,
            record,
        }
    }
}

/// Query state machine.
pub struct Query<T> {
    state: watch::Sender<QueryState<T>>,
    initial: T,
    mounted: AtomicBool,
    session: Option<Arc<dyn SessionExpiryHandler>>,
}

impl<T> std::fmt::Debug for Query<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("state", &*self.state.borrow())
            .field("mounted", &self.is_mounted())
            .finish_non_exhaustive()
    }
}

impl<T> Query<T> {
    /// Whether writes are still applied.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Stop applying writes.
    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::Release);
    }
}

impl<T> Query<T>
where
    T: Clone + Send + Sync,
{
    /// Mounted query in the idle state.
    #[must_use]
    pub fn new(initial: T) -> Self {
        let (state, _) = watch::channel(QueryState::idle(initial.clone()));
        Self {
            state,
            initial,
            mounted: AtomicBool::new(true),
            session: None,
        }
    }

    /// Route session timeouts to `handler`.
    #[must_use]
    pub fn with_session_handler(mut self, handler: Arc<dyn SessionExpiryHandler>) -> Self {
        self.session = Some(handler);
        self
    }

    /// Current snapshot.
    #[must_use]
    pub fn state(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    /// Observe state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.state.subscribe()
    }

    /// Run `operation` and fold its outcome into the state.
    ///
    /// Foreground loads clear the previous error first; polling loads keep
    /// both the error and the record visible while refreshing.
    ///
    /// # Errors
    ///
    /// Returns the operation's error after it has been applied to the state.
    pub async fn load<F, Fut>(&self, operation: F, is_polling: bool) -> Result<T, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        self.update(|state| {
            state.loading = true;
            if !is_polling {
                state.error_message = None;
            }
        });

        let outcome = intercept_session(self.session.as_deref(), operation().await);
        match &outcome {
            Ok(record) => self.update(|state| {
                state.loading = false;
                state.loaded = true;
                state.error_message = None;
                state.record = record.clone();
            }),
            Err(error) => {
                debug!(error = %error, is_polling, "query load failed");
                self.update(|state| {
                    state.loading = false;
                    if records_error(error, is_polling) {
                        state.error_message = Some(error.to_string());
                    }
                });
            }
        }
        outcome
    }

    /// Restore the initial record and idle flags.
    pub fn reset(&self) {
        let initial = self.initial.clone();
        self.update(|state| *state = QueryState::idle(initial));
    }

    fn update(&self, change: impl FnOnce(&mut QueryState<T>)) {
        if !self.is_mounted() {
            debug!("dropping query update after unmount");
            return;
        }
        self.state.send_modify(change);
    }
}
