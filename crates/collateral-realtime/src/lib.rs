//! Coalescing of realtime change notifications.
//!
//! A subscription to the hosted store delivers one event per changed row;
//! a bulk import or a busy collaborator produces a burst of them. Refreshing
//! on every event would re-fetch the same list dozens of times, so the
//! [`RefreshTrigger`] collapses each burst into a single refresh per quiet
//! period. It is the payload-less, single-key specialization of
//! [`collateral_autosave::SaveScheduler`]: every notification re-arms one
//! timer, and the refresh future bound at construction runs once the burst
//! goes quiet.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use collateral_autosave::{BoxError, SaveScheduler};
use tracing::trace;

type BoxedRefreshFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type RefreshFn = Arc<dyn Fn() -> BoxedRefreshFuture + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct RefreshTriggerConfig {
    /// Quiet period with no new notification before the refresh runs.
    pub debounce: Duration,
}

impl Default for RefreshTriggerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
        }
    }
}

/// Collapses bursts of notification events into one refresh per quiet
/// period.
///
/// Repeated [`notify`](Self::notify) calls keep re-arming the same timer;
/// notifications arriving while a refresh is already running queue exactly
/// one follow-up refresh. Must be used from within a Tokio runtime.
pub struct RefreshTrigger {
    scheduler: SaveScheduler<()>,
    refresh: RefreshFn,
    config: RefreshTriggerConfig,
}

impl RefreshTrigger {
    /// Bind the refresh future factory and the quiet-period length once.
    pub fn new<F, Fut>(config: RefreshTriggerConfig, refresh: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            scheduler: SaveScheduler::new(),
            refresh: Arc::new(move || Box::pin(refresh())),
            config,
        }
    }

    /// Record one change notification; re-arms the quiet-period timer.
    pub fn notify(&self) {
        trace!("change notification received");
        let refresh = Arc::clone(&self.refresh);
        self.scheduler.schedule((), self.config.debounce, move || async move {
            refresh().await;
            Ok::<(), BoxError>(())
        });
    }

    /// Discard a not-yet-fired refresh. A refresh already running completes.
    pub fn dispose(&self) {
        self.scheduler.cancel_all();
    }

    /// Resolve once no refresh is pending or running.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_for_pending_saves().await;
    }

    /// Number of refreshes that have run to completion.
    pub fn refresh_count(&self) -> u64 {
        self.scheduler.stats().executed
    }
}

impl Drop for RefreshTrigger {
    fn drop(&mut self) {
        self.scheduler.cancel_all();
    }
}
