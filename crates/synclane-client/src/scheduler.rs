//! Activity-aware polling: refresh after continued presence, not on a fixed clock.
//!
//! # Design
//! - At most one idle timer is live; every pointer movement restarts it.
//! - Hiding the tab cancels the timer. Showing it again refreshes at once if
//!   it stayed hidden past the blur threshold, otherwise re-arms the timer.
//! - The scheduler stands down while its query is loading or in error.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use synclane_config::PollingConfig;
use synclane_events::{ClientEvent, EventStream};
use synclane_telemetry::Metrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::query::QueryState;
use crate::synchronizer::PageSnapshot;

/// Shortest refresh interval the scheduler arms for.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(synclane_config::MIN_REFRESH_INTERVAL_MS);
/// Default hidden duration that forces an immediate refresh.
pub const BLUR_THRESHOLD: Duration = Duration::from_millis(synclane_config::BLUR_THRESHOLD_MS);

type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Loading and error flags the scheduler follows.
pub trait PollStatus {
    /// A load is in flight.
    fn is_loading(&self) -> bool;
    /// The last foreground load failed.
    fn has_error(&self) -> bool;
}

impl<T> PollStatus for QueryState<T> {
    fn is_loading(&self) -> bool {
        self.loading
    }

    fn has_error(&self) -> bool {
        self.error_message.is_some()
    }
}

impl<R> PollStatus for PageSnapshot<R> {
    fn is_loading(&self) -> bool {
        self.loading
    }

    fn has_error(&self) -> bool {
        self.error_message.is_some()
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Whether background refreshes happen at all.
    pub auto_sync: bool,
    /// Idle delay before a refresh.
    pub refresh_interval: Duration,
    /// Hidden duration that forces an immediate refresh.
    pub blur_threshold: Duration,
}

impl From<&PollingConfig> for SchedulerOptions {
    fn from(config: &PollingConfig) -> Self {
        Self {
            auto_sync: config.auto_sync,
            refresh_interval: config.refresh_interval(),
            blur_threshold: config.blur_threshold(),
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

#[derive(Default)]
struct SchedulerState {
    loading: bool,
    errored: bool,
    hidden_since: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    shut_down: bool,
}

impl SchedulerState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct SchedulerInner {
    load: RefreshFn,
    options: SchedulerOptions,
    metrics: Option<Metrics>,
    state: Mutex<SchedulerState>,
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_enabled(&self) -> bool {
        self.options.auto_sync && self.options.refresh_interval >= MIN_REFRESH_INTERVAL
    }

    fn is_armed(&self, state: &SchedulerState) -> bool {
        self.is_enabled() && !state.loading && !state.errored && !state.shut_down
    }

    async fn fire(&self, trigger: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_scheduler_refresh(trigger);
        }
        info!(trigger, "background refresh");
        (self.load)().await;
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_timer();
    }
}

/// Debounced background refresh driven by user activity.
#[derive(Clone)]
pub struct PollingScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("options", &self.inner.options)
            .field("timer_pending", &self.has_pending_timer())
            .finish_non_exhaustive()
    }
}

impl PollingScheduler {
    /// Scheduler invoking `load` for every background refresh.
    pub fn new<F, Fut>(load: F, options: SchedulerOptions, metrics: Option<Metrics>) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if options.auto_sync && options.refresh_interval < MIN_REFRESH_INTERVAL {
            debug!(
                interval_ms = options.refresh_interval.as_millis(),
                "refresh interval below minimum; polling disabled"
            );
        }
        Self {
            inner: Arc::new(SchedulerInner {
                load: Arc::new(move || load().boxed()),
                options,
                metrics,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Whether the options allow background refreshes at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    /// Whether an idle timer is live.
    #[must_use]
    pub fn has_pending_timer(&self) -> bool {
        self.inner.state().timer.is_some()
    }

    /// Follow the query's loading and error flags.
    pub fn set_status(&self, loading: bool, has_error: bool) {
        let mut state = self.inner.state();
        state.loading = loading;
        state.errored = has_error;
        if !self.inner.is_armed(&state) {
            state.cancel_timer();
        }
    }

    /// User activity: restart the idle timer.
    pub fn on_pointer_move(&self) {
        let mut state = self.inner.state();
        if !self.inner.is_armed(&state) || state.hidden_since.is_some() {
            return;
        }
        self.restart_timer(&mut state);
    }

    /// The host tab was hidden (`true`) or shown (`false`).
    pub fn on_visibility_change(&self, hidden: bool) {
        let mut state = self.inner.state();
        if hidden {
            state.cancel_timer();
            state.hidden_since.get_or_insert_with(Instant::now);
            return;
        }
        let hidden_for = state.hidden_since.take().map(|since| since.elapsed());
        if !self.inner.is_armed(&state) {
            return;
        }
        match hidden_for {
            Some(elapsed) if elapsed > self.inner.options.blur_threshold => {
                state.cancel_timer();
                drop(state);
                debug!(hidden_ms = elapsed.as_millis(), "tab visible after blur threshold");
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.fire("visible").await });
            }
            _ => self.restart_timer(&mut state),
        }
    }

    /// Route one client event.
    pub fn handle_event(&self, event: &ClientEvent) {
        match event {
            ClientEvent::PointerMoved => self.on_pointer_move(),
            ClientEvent::VisibilityChanged { hidden } => self.on_visibility_change(*hidden),
            _ => {}
        }
    }

    /// Consume activity events until the stream closes or the scheduler shuts down.
    pub async fn run(&self, mut events: EventStream) {
        while let Some(envelope) = events.next().await {
            if self.inner.state().shut_down {
                break;
            }
            self.handle_event(&envelope.event);
        }
        debug!("polling scheduler event loop finished");
    }

    /// Mirror a query's state into [`PollingScheduler::set_status`] until the
    /// query is dropped or the scheduler shuts down.
    pub fn follow<S>(&self, mut status: watch::Receiver<S>) -> JoinHandle<()>
    where
        S: PollStatus + Send + Sync + 'static,
    {
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let (loading, errored) = {
                    let current = status.borrow_and_update();
                    (current.is_loading(), current.has_error())
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.state().shut_down {
                    return;
                }
                Self { inner }.set_status(loading, errored);
                if status.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    /// Stop scheduling; the live timer is cancelled.
    pub fn shutdown(&self) {
        let mut state = self.inner.state();
        state.shut_down = true;
        state.cancel_timer();
    }

    fn restart_timer(&self, state: &mut SchedulerState) {
        state.cancel_timer();
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let interval = self.inner.options.refresh_interval;
        let weak = Arc::downgrade(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.state();
                if state.timer_generation != generation || !inner.is_armed(&state) {
                    return;
                }
                // Detach so a later restart cannot abort the refresh itself.
                drop(state.timer.take());
            }
            inner.fire("idle").await;
        }));
    }
}
