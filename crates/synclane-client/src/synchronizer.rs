//! Paginated record synchronizer with stale-while-revalidate patches.
//!
//! # Design
//! - Every non-incremental load starts a new generation; results and stale
//!   patches from an older generation are discarded on arrival.
//! - Foreground loads clear the page map up front. Polling loads defer the
//!   clear to their first patch or result so observers keep stale records.
//! - Next-page loads never clear: their patches and results land at their
//!   own key and an untotalled page keeps the last known total.
//! - `reset` snapshots the pending tokens under the lock and cancels them
//!   after releasing it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use synclane_config::PagesConfig;
use synclane_events::{CancelReason, ClientEvent, EventBus};
use synclane_telemetry::Metrics;
use tokio::sync::watch;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::RequestError;
use crate::pages::{FinderOutput, NormalizedPage, PageMap, infer_has_next_page};
use crate::query::{SessionExpiryHandler, intercept_session, records_error};

/// Boxed future returned by a finder.
pub type FinderFuture<R> = BoxFuture<'static, Result<FinderOutput<R>, RequestError>>;
type Finder<R> = Arc<dyn Fn(PageRequest<R>) -> FinderFuture<R> + Send + Sync>;

/// Parameters of one load; unset fields reuse the last-used values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageParams {
    /// Page size.
    pub limit: Option<u32>,
    /// Record offset.
    pub offset: Option<u64>,
    /// Search term; an empty string clears it.
    pub search_term: Option<String>,
    /// Append a page instead of replacing the map.
    pub is_loading_next_page: bool,
    /// Background refresh: failures are swallowed.
    pub is_polling: bool,
}

/// Synchronizer defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynchronizerOptions {
    /// Initial page size.
    pub limit: u32,
    /// Whether `load_next_page` may run.
    pub next_page_enabled: bool,
}

impl From<&PagesConfig> for SynchronizerOptions {
    fn from(config: &PagesConfig) -> Self {
        Self {
            limit: config.default_limit,
            next_page_enabled: config.next_page_enabled,
        }
    }
}

impl Default for SynchronizerOptions {
    fn default() -> Self {
        Self::from(&PagesConfig::default())
    }
}

/// Observable synchronizer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot<R> {
    /// Records of every page in ascending key order.
    pub all_page_records: Vec<R>,
    /// Last known total, when the server reported one.
    pub records_total_count: Option<u64>,
    /// Whether another page can be loaded.
    pub has_next_page: bool,
    /// A load is in flight.
    pub loading: bool,
    /// An incremental load is in flight.
    pub loading_next_page: bool,
    /// At least one load succeeded since the last reset.
    pub loaded: bool,
    /// Message of the last foreground failure.
    pub error_message: Option<String>,
    /// Current page size.
    pub limit: u32,
    /// Offset of the last non-incremental load.
    pub offset: u64,
    /// Current search term.
    pub search_term: Option<String>,
}

/// Arguments handed to the finder.
pub struct PageRequest<R> {
    /// Page size.
    pub limit: u32,
    /// Record offset.
    pub offset: u64,
    /// Search term.
    pub search_term: Option<String>,
    /// Whether the page is appended.
    pub is_loading_next_page: bool,
    /// Whether the load is a background refresh.
    pub is_polling: bool,
    cancellation: CancellationToken,
    stale: StaleWriter<R>,
}

impl<R> fmt::Debug for PageRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRequest")
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("search_term", &self.search_term)
            .field("is_loading_next_page", &self.is_loading_next_page)
            .field("is_polling", &self.is_polling)
            .finish_non_exhaustive()
    }
}

impl<R> PageRequest<R> {
    /// Token cancelled when the synchronizer is reset.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Handle for publishing provisional data before the finder settles.
    #[must_use]
    pub fn stale_while_revalidate(&self) -> StaleWriter<R> {
        self.stale.clone()
    }
}

/// Writes provisional pages while a load is still in flight.
pub struct StaleWriter<R> {
    inner: Arc<SyncInner<R>>,
    generation: u64,
    offset: u64,
    is_next_page: bool,
    token: CancellationToken,
}

impl<R> Clone for StaleWriter<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            generation: self.generation,
            offset: self.offset,
            is_next_page: self.is_next_page,
            token: self.token.clone(),
        }
    }
}

impl<R> fmt::Debug for StaleWriter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaleWriter")
            .field("generation", &self.generation)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl<R: Clone> StaleWriter<R> {
    /// Patch the exposed pages with `data`; loading stays on.
    ///
    /// Returns `false` when the load was cancelled or superseded.
    pub fn write(&self, data: impl Into<FinderOutput<R>>) -> bool {
        if self.token.is_cancelled() || !self.inner.is_mounted() {
            return false;
        }
        let mut state = self.inner.state();
        if state.generation != self.generation {
            return false;
        }
        apply_page(
            &mut state,
            NormalizedPage::from_output(data.into(), self.offset),
            self.is_next_page,
        );
        debug!(offset = self.offset, records = state.pages.record_count(), "applied stale page");
        self.inner.publish(&state);
        true
    }
}

struct SyncState<R> {
    limit: u32,
    offset: u64,
    search_term: Option<String>,
    revalidation_key: Option<String>,
    pages: PageMap<R>,
    total: Option<u64>,
    explicit_next: Option<bool>,
    has_next_page: bool,
    generation: u64,
    pending_clear: bool,
    loads_in_flight: usize,
    next_page_loads: usize,
    loaded: bool,
    load_issued: bool,
    error_message: Option<String>,
    pending: HashMap<u64, CancellationToken>,
    next_pending_id: u64,
}

impl<R> SyncState<R> {
    fn new(options: SynchronizerOptions) -> Self {
        Self {
            limit: options.limit,
            offset: 0,
            search_term: None,
            revalidation_key: None,
            pages: PageMap::new(),
            total: None,
            explicit_next: None,
            has_next_page: false,
            generation: 0,
            pending_clear: false,
            loads_in_flight: 0,
            next_page_loads: 0,
            loaded: false,
            load_issued: false,
            error_message: None,
            pending: HashMap::new(),
            next_pending_id: 0,
        }
    }

    fn clear_pages(&mut self) {
        self.pages.clear();
        self.total = None;
        self.explicit_next = None;
        self.has_next_page = false;
        self.pending_clear = false;
    }
}

fn apply_page<R>(state: &mut SyncState<R>, page: NormalizedPage<R>, is_next_page: bool) {
    if is_next_page {
        if page.paginated {
            state.total = page.total;
            state.explicit_next = page.explicit_next;
        } else {
            state.explicit_next = None;
        }
        state.pages.insert(page.key, page.records);
    } else {
        if state.pending_clear || !page.paginated {
            state.clear_pages();
        }
        let total = if page.paginated {
            page.total
        } else {
            Some(u64::try_from(page.records.len()).unwrap_or(u64::MAX))
        };
        state.pages.insert(page.key, page.records);
        state.total = total;
        state.explicit_next = page.explicit_next;
    }
    state.has_next_page =
        infer_has_next_page(state.explicit_next, state.pages.record_count(), state.total);
}

struct SyncInner<R> {
    finder: Finder<R>,
    state: Mutex<SyncState<R>>,
    snapshot: watch::Sender<PageSnapshot<R>>,
    next_page_enabled: bool,
    mounted: AtomicBool,
    session: Option<Arc<dyn SessionExpiryHandler>>,
    events: Option<EventBus>,
    metrics: Option<Metrics>,
}

impl<R> SyncInner<R> {
    fn state(&self) -> MutexGuard<'_, SyncState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }
}

impl<R: Clone> SyncInner<R> {
    fn publish(&self, state: &SyncState<R>) {
        if !self.is_mounted() {
            return;
        }
        self.snapshot.send_replace(build_snapshot(state));
    }
}

fn build_snapshot<R: Clone>(state: &SyncState<R>) -> PageSnapshot<R> {
    PageSnapshot {
        all_page_records: state.pages.flatten(),
        records_total_count: state.total,
        has_next_page: state.has_next_page,
        loading: state.loads_in_flight > 0,
        loading_next_page: state.next_page_loads > 0,
        loaded: state.loaded,
        error_message: state.error_message.clone(),
        limit: state.limit,
        offset: state.offset,
        search_term: state.search_term.clone(),
    }
}

/// Bookkeeping for one in-flight load; releases its slot on drop.
struct LoadTicket<R: Clone> {
    inner: Arc<SyncInner<R>>,
    id: u64,
    generation: u64,
    offset: u64,
    is_next_page: bool,
    is_polling: bool,
    token: CancellationToken,
    released: bool,
}

impl<R: Clone> LoadTicket<R> {
    fn release(&mut self, state: &mut SyncState<R>) {
        if self.released {
            return;
        }
        self.released = true;
        state.pending.remove(&self.id);
        state.loads_in_flight = state.loads_in_flight.saturating_sub(1);
        if self.is_next_page {
            state.next_page_loads = state.next_page_loads.saturating_sub(1);
        }
    }

    fn is_current(&self, state: &SyncState<R>) -> bool {
        !self.token.is_cancelled() && state.generation == self.generation
    }
}

impl<R: Clone> Drop for LoadTicket<R> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let mut state = inner.state();
        self.release(&mut state);
        if self.is_polling && state.generation == self.generation {
            state.pending_clear = false;
        }
        inner.publish(&state);
    }
}

/// Optional collaborators for a [`Synchronizer`].
pub struct SynchronizerBuilder<R> {
    finder: Finder<R>,
    options: SynchronizerOptions,
    session: Option<Arc<dyn SessionExpiryHandler>>,
    events: Option<EventBus>,
    metrics: Option<Metrics>,
}

impl<R> fmt::Debug for SynchronizerBuilder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizerBuilder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<R> SynchronizerBuilder<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Route session timeouts to `handler`.
    #[must_use]
    pub fn session_handler(mut self, handler: Arc<dyn SessionExpiryHandler>) -> Self {
        self.session = Some(handler);
        self
    }

    /// Announce reset cancellations on `events`.
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Count reset cancellations in `metrics`.
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assemble the synchronizer.
    #[must_use]
    pub fn build(self) -> Synchronizer<R> {
        let state = SyncState::new(self.options);
        let (snapshot, _) = watch::channel(build_snapshot(&state));
        Synchronizer {
            inner: Arc::new(SyncInner {
                finder: self.finder,
                state: Mutex::new(state),
                snapshot,
                next_page_enabled: self.options.next_page_enabled,
                mounted: AtomicBool::new(true),
                session: self.session,
                events: self.events,
                metrics: self.metrics,
            }),
        }
    }
}

/// Fetches, assembles and revalidates a multi-page result set.
pub struct Synchronizer<R> {
    inner: Arc<SyncInner<R>>,
}

impl<R> Clone for Synchronizer<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> fmt::Debug for Synchronizer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("next_page_enabled", &self.inner.next_page_enabled)
            .field("mounted", &self.inner.is_mounted())
            .finish_non_exhaustive()
    }
}

impl<R> Synchronizer<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Synchronizer delegating page fetches to `finder`.
    pub fn new<F, Fut>(finder: F, options: SynchronizerOptions) -> Self
    where
        F: Fn(PageRequest<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FinderOutput<R>, RequestError>> + Send + 'static,
    {
        Self::builder(finder, options).build()
    }

    /// Start configuring a synchronizer around `finder`.
    pub fn builder<F, Fut>(finder: F, options: SynchronizerOptions) -> SynchronizerBuilder<R>
    where
        F: Fn(PageRequest<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FinderOutput<R>, RequestError>> + Send + 'static,
    {
        SynchronizerBuilder {
            finder: Arc::new(move |request| finder(request).boxed()),
            options,
            session: None,
            events: None,
            metrics: None,
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> PageSnapshot<R> {
        self.inner.snapshot.borrow().clone()
    }

    /// Observe snapshot changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PageSnapshot<R>> {
        self.inner.snapshot.subscribe()
    }

    /// Copy of the current page map.
    #[must_use]
    pub fn pages(&self) -> PageMap<R> {
        self.inner.state().pages.clone()
    }

    /// Page loads holding a live cancellation token.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Whether state changes are still published.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    /// Stop publishing state and cancel pending loads.
    pub fn unmount(&self) {
        self.inner.mounted.store(false, Ordering::Release);
        self.cancel_pending();
    }

    /// Fetch one page through the finder and fold it into the page map.
    ///
    /// # Errors
    ///
    /// Returns the finder's error after it has been applied to the state,
    /// or [`RequestError::Cancelled`] when the result was cancelled or
    /// superseded by a newer load.
    pub async fn load(&self, params: PageParams) -> Result<(), RequestError> {
        let (request, mut ticket) = self.begin(params);
        let token = ticket.token.clone();
        let settled = tokio::select! {
            biased;
            () = token.cancelled() => Err(RequestError::Cancelled),
            settled = (self.inner.finder)(request) => settled,
        };
        let settled = intercept_session(self.inner.session.as_deref(), settled);

        let mut state = self.inner.state();
        ticket.release(&mut state);
        let current = ticket.is_current(&state);
        let outcome = match settled {
            Ok(output) if current && self.inner.is_mounted() => {
                apply_page(
                    &mut state,
                    NormalizedPage::from_output(output, ticket.offset),
                    ticket.is_next_page,
                );
                state.loaded = true;
                state.error_message = None;
                Ok(())
            }
            Ok(_) => {
                debug!(generation = ticket.generation, "discarding superseded page");
                Err(RequestError::Cancelled)
            }
            Err(error) => {
                if current {
                    if ticket.is_polling {
                        state.pending_clear = false;
                    }
                    if records_error(&error, ticket.is_polling) {
                        state.error_message = Some(error.to_string());
                    }
                }
                debug!(error = %error, is_polling = ticket.is_polling, "page load failed");
                Err(error)
            }
        };
        self.inner.publish(&state);
        outcome
    }

    fn begin(&self, params: PageParams) -> (PageRequest<R>, LoadTicket<R>) {
        let mut state = self.inner.state();
        if let Some(limit) = params.limit {
            state.limit = limit;
        }
        if let Some(term) = params.search_term {
            state.search_term = Some(term).filter(|term| !term.trim().is_empty());
        }
        let offset = if params.is_loading_next_page {
            params.offset.unwrap_or_else(|| state.pages.next_offset())
        } else {
            if let Some(offset) = params.offset {
                state.offset = offset;
            }
            state.generation += 1;
            if params.is_polling {
                state.pending_clear = true;
            } else {
                state.clear_pages();
            }
            state.offset
        };
        if !params.is_polling {
            state.error_message = None;
        }

        state.load_issued = true;
        state.loads_in_flight += 1;
        if params.is_loading_next_page {
            state.next_page_loads += 1;
        }
        let id = state.next_pending_id;
        state.next_pending_id += 1;
        let token = CancellationToken::new();
        state.pending.insert(id, token.clone());
        let generation = state.generation;

        let request = PageRequest {
            limit: state.limit,
            offset,
            search_term: state.search_term.clone(),
            is_loading_next_page: params.is_loading_next_page,
            is_polling: params.is_polling,
            cancellation: token.clone(),
            stale: StaleWriter {
                inner: Arc::clone(&self.inner),
                generation,
                offset,
                is_next_page: params.is_loading_next_page,
                token: token.clone(),
            },
        };
        self.inner.publish(&state);
        drop(state);

        debug!(offset, limit = request.limit, generation, "loading page");
        let ticket = LoadTicket {
            inner: Arc::clone(&self.inner),
            id,
            generation,
            offset,
            is_next_page: params.is_loading_next_page,
            is_polling: params.is_polling,
            token,
            released: false,
        };
        (request, ticket)
    }

    /// Append the page after the highest loaded one.
    ///
    /// Returns `Ok(false)` without loading when a load is in flight, next
    /// pages are disabled, or no further page is known.
    ///
    /// # Errors
    ///
    /// See [`Synchronizer::load`].
    pub async fn load_next_page(&self) -> Result<bool, RequestError> {
        let offset = {
            let state = self.inner.state();
            if !self.inner.next_page_enabled || state.loads_in_flight > 0 || !state.has_next_page {
                debug!(
                    enabled = self.inner.next_page_enabled,
                    in_flight = state.loads_in_flight,
                    has_next_page = state.has_next_page,
                    "skipping next page"
                );
                return Ok(false);
            }
            state.pages.next_offset()
        };
        self.load(PageParams {
            offset: Some(offset),
            is_loading_next_page: true,
            ..PageParams::default()
        })
        .await
        .map(|()| true)
    }

    /// Reload from the last-used offset.
    ///
    /// # Errors
    ///
    /// See [`Synchronizer::load`].
    pub async fn refresh(&self, is_polling: bool) -> Result<(), RequestError> {
        self.load(PageParams {
            is_polling,
            ..PageParams::default()
        })
        .await
    }

    /// Change the revalidation key; reloads from offset zero when it changed
    /// after the first load was issued, whether or not that load succeeded.
    ///
    /// # Errors
    ///
    /// See [`Synchronizer::load`].
    pub async fn set_revalidation_key(&self, key: Option<String>) -> Result<bool, RequestError> {
        self.revalidate(|state| {
            let changed = state.revalidation_key != key;
            state.revalidation_key = key;
            changed
        })
        .await
    }

    /// Change the page size; reloads when it changed after the first load.
    ///
    /// # Errors
    ///
    /// See [`Synchronizer::load`].
    pub async fn set_limit(&self, limit: u32) -> Result<bool, RequestError> {
        self.revalidate(|state| {
            let changed = state.limit != limit;
            state.limit = limit;
            changed
        })
        .await
    }

    /// Change the search term; reloads when it changed after the first load.
    ///
    /// # Errors
    ///
    /// See [`Synchronizer::load`].
    pub async fn set_search_term(&self, term: Option<String>) -> Result<bool, RequestError> {
        let term = term.filter(|term| !term.trim().is_empty());
        self.revalidate(|state| {
            let changed = state.search_term != term;
            state.search_term = term;
            changed
        })
        .await
    }

    async fn revalidate(
        &self,
        change: impl FnOnce(&mut SyncState<R>) -> bool,
    ) -> Result<bool, RequestError> {
        let reload = {
            let mut state = self.inner.state();
            let changed = change(&mut state);
            self.inner.publish(&state);
            changed && state.load_issued
        };
        if !reload {
            return Ok(false);
        }
        self.load(PageParams {
            offset: Some(0),
            ..PageParams::default()
        })
        .await
        .map(|()| true)
    }

    /// Clear pages and counts and cancel every pending page load.
    ///
    /// Returns how many pending loads were cancelled.
    pub fn reset(&self) -> usize {
        {
            let mut state = self.inner.state();
            state.clear_pages();
            state.generation += 1;
            state.loaded = false;
            state.error_message = None;
            self.inner.publish(&state);
        }
        self.cancel_pending()
    }

    fn cancel_pending(&self) -> usize {
        let snapshot: Vec<CancellationToken> = self.inner.state().pending.values().cloned().collect();
        let count = snapshot.into_iter().filter(CancellationToken::cancel).count();
        if count > 0 {
            debug!(cancelled = count, "cancelled pending page loads");
            let reason = CancelReason::SynchronizerReset;
            if let Some(metrics) = &self.inner.metrics {
                metrics.add_cancelled(reason.as_str(), count);
            }
            if let Some(events) = &self.inner.events {
                events.publish(ClientEvent::RequestsCancelled { count, reason });
            }
        }
        count
    }
}
