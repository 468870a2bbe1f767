//! Debounced save coordination for collateral editors.
//!
//! This crate is intentionally self-contained so it can sit under any UI or
//! transport layer; the persistence backend is an opaque asynchronous write
//! supplied by the caller. It exposes:
//! - Keyed debouncing of rapid edits ("last write wins within the window")
//! - At most one in-flight save per key, with generation-based staleness
//!   tracking so a slow stale write never masquerades as newer work
//! - Graceful drain (`wait_for_pending_saves`) and bulk cancellation for
//!   page teardown
//! - Cumulative scheduling counters for observability

mod scheduler;

pub use scheduler::{
    BoxError, SaveError, SaveObserver, SaveOutcome, SaveResult, SaveScheduler, SaveSchedulerStats,
};
