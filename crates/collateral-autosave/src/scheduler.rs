use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// The error type save producers resolve with on failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by save producers.
pub type SaveResult = Result<(), BoxError>;

/// Why a save attempt did not succeed.
#[derive(Debug, Error)]
pub enum SaveError {
    /// The producer resolved with the caller's own error.
    #[error("save failed: {0}")]
    Backend(#[source] BoxError),
    /// The producer panicked; the scheduler absorbed the panic.
    #[error("save task panicked")]
    Panicked,
}

/// What a settled save attempt reported, handed to the completion observer.
#[derive(Debug)]
pub struct SaveOutcome {
    /// The producer's own result, wrapped as a [`SaveError`] on failure.
    pub result: Result<(), SaveError>,
    /// True when a newer edit for the same key was already scheduled by the
    /// time this attempt settled. The outcome is still this attempt's truth;
    /// the newer work runs next and is unaffected by it.
    pub superseded: bool,
}

impl SaveOutcome {
    /// Whether the write was performed successfully.
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

type BoxedSaveFuture = Pin<Box<dyn Future<Output = SaveResult> + Send>>;
type BoxedProducer = Box<dyn FnOnce() -> BoxedSaveFuture + Send>;
type StartFn = Box<dyn FnOnce() + Send>;
type CompleteFn = Box<dyn FnOnce(SaveOutcome) + Send>;

/// Optional callbacks observing one scheduled save.
///
/// `on_start` fires when the producer is about to run (after the debounce
/// window, never inside `schedule`). `on_complete` fires exactly once when
/// the attempt settles. Neither fires for an entry that was superseded or
/// cancelled before its timer elapsed.
#[derive(Default)]
pub struct SaveObserver {
    on_start: Option<StartFn>,
    on_complete: Option<CompleteFn>,
}

impl SaveObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(SaveOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

/// Cumulative scheduling counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SaveSchedulerStats {
    /// Total `schedule` calls.
    pub scheduled: u64,
    /// Pending entries replaced by a newer edit before their timer fired.
    pub coalesced: u64,
    /// Producers that ran to completion, successfully or not.
    pub executed: u64,
    /// Executed producers that failed or panicked.
    pub failed: u64,
    /// Pending entries discarded by `cancel_all`.
    pub cancelled: u64,
}

/// One open debounce window for a key.
struct PendingEntry {
    generation: u64,
    producer: BoxedProducer,
    observer: SaveObserver,
    /// Timer task for the window. `None` once the window has elapsed and the
    /// entry is waiting for the key's in-flight save to settle.
    timer: Option<JoinHandle<()>>,
}

/// One running save for a key.
struct InFlightEntry {
    generation: u64,
}

struct Registry<K> {
    pending: HashMap<K, PendingEntry>,
    in_flight: HashMap<K, InFlightEntry>,
    stats: SaveSchedulerStats,
}

impl<K: Eq + Hash> Registry<K> {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Next generation for a key: one past the newest live entry, or 1 when
    /// the key is idle. Staleness checks only ever compare generations of
    /// concurrently-live entries, so restarting at 1 after idle is sound.
    fn next_generation(&self, key: &K) -> u64 {
        let pending = self.pending.get(key).map_or(0, |e| e.generation);
        let running = self.in_flight.get(key).map_or(0, |e| e.generation);
        pending.max(running) + 1
    }
}

struct Shared<K> {
    registry: Mutex<Registry<K>>,
    /// Signalled whenever a save settles or pending work is cancelled, i.e.
    /// whenever the registry may have reached idle.
    settled: Notify,
}

impl<K> Shared<K> {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry<K>> {
        self.registry.lock().expect("scheduler mutex poisoned")
    }
}

/// Keyed debounce + at-most-one-in-flight-per-key execution of asynchronous
/// saves.
///
/// Each key is an independent debounce stream: scheduling an edit for a key
/// restarts that key's timer, and only the most recently scheduled producer
/// runs once the window elapses ("last write wins within the window"). Once
/// a producer is running, a newer edit for the same key never overlaps it;
/// the newer work is queued and runs immediately after the running save
/// settles. Different keys never block each other.
///
/// The scheduler is cheap to clone (all clones share one registry) and must
/// be used from within a Tokio runtime: timers and producers run on spawned
/// tasks. `schedule` never blocks and never runs the producer synchronously,
/// even with a zero delay.
pub struct SaveScheduler<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for SaveScheduler<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> Default for SaveScheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> SaveScheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    pending: HashMap::new(),
                    in_flight: HashMap::new(),
                    stats: SaveSchedulerStats::default(),
                }),
                settled: Notify::new(),
            }),
        }
    }

    /// Debounce a save for `key`: run `producer` once `delay` has elapsed
    /// with no newer `schedule` call for the same key.
    ///
    /// A pending save for the same key is replaced: its timer is cancelled
    /// and its producer and callbacks never run. The producer performs
    /// exactly one logical write and reports its outcome through its result;
    /// the scheduler does not retry and absorbs all producer failures.
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, producer: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SaveResult> + Send + 'static,
    {
        self.schedule_with(key, delay, producer, SaveObserver::new());
    }

    /// [`schedule`](Self::schedule) with start/completion observers attached.
    pub fn schedule_with<F, Fut>(&self, key: K, delay: Duration, producer: F, observer: SaveObserver)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SaveResult> + Send + 'static,
    {
        let producer: BoxedProducer = Box::new(move || Box::pin(producer()));

        let mut registry = self.shared.registry();
        let generation = registry.next_generation(&key);
        if let Some(previous) = registry.pending.remove(&key) {
            if let Some(timer) = previous.timer {
                timer.abort();
            }
            registry.stats.coalesced += 1;
            trace!(generation, "pending save superseded by a newer edit");
        }
        registry.stats.scheduled += 1;

        let timer = tokio::spawn({
            let shared = Arc::clone(&self.shared);
            let key = key.clone();
            async move {
                tokio::time::sleep(delay).await;
                run_due(shared, key, generation).await;
            }
        });
        registry.pending.insert(
            key,
            PendingEntry {
                generation,
                producer,
                observer,
                timer: Some(timer),
            },
        );
    }

    /// Discard every pending save whose timer has not fired yet. Their
    /// producers never run and their observers never fire.
    ///
    /// Saves already in flight are not interrupted; they run to completion.
    /// Aborting a half-sent write is unsafe in general, discarding an unsent
    /// one is safe.
    pub fn cancel_all(&self) {
        let cancelled = {
            let mut registry = self.shared.registry();
            let mut cancelled = 0u64;
            for (_, entry) in registry.pending.drain() {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                cancelled += 1;
            }
            registry.stats.cancelled += cancelled;
            cancelled
        };
        if cancelled > 0 {
            debug!(cancelled, "discarded pending saves");
        }
        self.shared.settled.notify_waiters();
    }

    /// Resolve once no save is pending or in flight.
    ///
    /// This re-checks after every settle, so follow-up work queued behind an
    /// in-flight save is covered. It resolves regardless of whether
    /// individual saves succeeded; "drained" means nothing is outstanding,
    /// not that everything persisted. Scheduling new work concurrently with
    /// a drain is unsupported (stop scheduling first); a straggler extends
    /// the drain rather than breaking it.
    pub async fn wait_for_pending_saves(&self) {
        loop {
            let settled = self.shared.settled.notified();
            tokio::pin!(settled);
            // Register interest before the idle check so a settle in between
            // cannot be missed.
            settled.as_mut().enable();
            if self.is_idle() {
                return;
            }
            settled.await;
        }
    }

    /// Run every pending save now instead of waiting out its debounce
    /// window, then drain.
    pub async fn flush(&self) {
        {
            let mut registry = self.shared.registry();
            let keys: Vec<K> = registry.pending.keys().cloned().collect();
            for key in keys {
                let Some(entry) = registry.pending.get_mut(&key) else {
                    continue;
                };
                // Entries already waiting on an in-flight save need no push.
                let Some(timer) = entry.timer.take() else {
                    continue;
                };
                // Drop the handle without aborting. The sleeper may already
                // be past its sleep, blocked on this lock, and about to
                // promote the entry; an abort would cancel it mid-execution
                // and strand the in-flight entry. A stale sleeper that loses
                // the race revalidates under the lock and returns.
                drop(timer);
                let generation = entry.generation;
                tokio::spawn(run_due(Arc::clone(&self.shared), key, generation));
            }
        }
        self.wait_for_pending_saves().await;
    }

    /// Whether the registry holds no pending and no in-flight saves.
    pub fn is_idle(&self) -> bool {
        self.shared.registry().is_idle()
    }

    /// Snapshot of the cumulative scheduling counters.
    pub fn stats(&self) -> SaveSchedulerStats {
        self.shared.registry().stats
    }
}

/// A key's debounce window has elapsed: promote the entry to execution, or
/// park it behind the key's in-flight save.
///
/// Registry mutations are single check-and-mutate critical sections with no
/// await in between; the producer is only awaited with the lock released.
async fn run_due<K>(shared: Arc<Shared<K>>, key: K, generation: u64)
where
    K: Eq + Hash + Clone + Send + 'static,
{
    let mut current = {
        let mut registry = shared.registry();
        let due = matches!(
            registry.pending.get(&key),
            Some(entry) if entry.generation == generation
        );
        if !due {
            // Superseded or cancelled while the timer slept.
            return;
        }
        if registry.in_flight.contains_key(&key) {
            // Window elapsed but an older save is still running. Park the
            // entry; the settle path promotes it without a timer re-arm.
            if let Some(entry) = registry.pending.get_mut(&key) {
                entry.timer = None;
            }
            trace!(generation, "save ready, waiting for in-flight predecessor");
            return;
        }
        let Some(entry) = registry.pending.remove(&key) else {
            return;
        };
        registry.in_flight.insert(
            key.clone(),
            InFlightEntry {
                generation: entry.generation,
            },
        );
        entry
    };

    loop {
        let PendingEntry {
            generation,
            producer,
            observer,
            ..
        } = current;

        if let Some(on_start) = observer.on_start {
            run_callback(on_start, "start");
        }

        // The producer runs on its own task so a panic surfaces as a
        // JoinError here instead of leaving the in-flight entry stranded.
        let joined = tokio::spawn(async move { producer().await }).await;
        let result = match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SaveError::Backend(err)),
            Err(_) => Err(SaveError::Panicked),
        };
        match &result {
            Ok(()) => trace!(generation, "save completed"),
            Err(err) => warn!(generation, error = %err, "save attempt failed"),
        }

        // Settle: retire the in-flight entry and promote a parked follow-up
        // in the same critical section, so no other timer can slip in
        // between and the key is never wrongly observed idle.
        let (superseded, next) = {
            let mut registry = shared.registry();
            registry.in_flight.remove(&key);
            registry.stats.executed += 1;
            if result.is_err() {
                registry.stats.failed += 1;
            }
            let superseded = registry.pending.contains_key(&key);
            let parked = matches!(
                registry.pending.get(&key),
                Some(entry) if entry.timer.is_none()
            );
            let mut next = None;
            if parked {
                if let Some(entry) = registry.pending.remove(&key) {
                    registry.in_flight.insert(
                        key.clone(),
                        InFlightEntry {
                            generation: entry.generation,
                        },
                    );
                    next = Some(entry);
                }
            }
            (superseded, next)
        };
        shared.settled.notify_waiters();

        if let Some(on_complete) = observer.on_complete {
            let outcome = SaveOutcome { result, superseded };
            run_callback(move || on_complete(outcome), "completion");
        }

        match next {
            Some(entry) => current = entry,
            None => return,
        }
    }
}

/// Observer callbacks are caller code; a panic there must not take the
/// execution task (and any promoted follow-up save) down with it.
fn run_callback(f: impl FnOnce(), which: &str) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("save {which} callback panicked");
    }
}
