//! Diagnostics sink for failures the background workers swallow.
//!
//! Workers recover from every failure locally (unroutable tasks, handler errors, failed
//! log flushes). Each recovery is reported here exactly once: the sink emits a `tracing`
//! event under the `cityscore::diagnostics` target and bumps a counter.
//!
//! This is deliberately *not* the application log pipeline. Routing a failed log flush
//! back into the log channel would feed on itself.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, error, warn};

pub const TARGET: &str = "cityscore::diagnostics";

/// Point-in-time copy of the diagnostics counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub unroutable_tasks: u64,
    pub handler_failures: u64,
    pub superseded_timers: u64,
    pub flush_failures: u64,
    pub entries_discarded: u64,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    unroutable_tasks: AtomicU64,
    handler_failures: AtomicU64,
    superseded_timers: AtomicU64,
    flush_failures: AtomicU64,
    entries_discarded: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A work item named a task type with no registered handler; it was dropped.
    pub fn unroutable(&self, task_type: &str, item_id: &dyn Display) {
        self.unroutable_tasks.fetch_add(1, Ordering::Relaxed);
        warn!(target: TARGET, task_type, item_id = %item_id, "dropping work item with no registered handler");
    }

    /// A handler returned an error or timed out.
    pub fn handler_failed(&self, task_type: &str, debounced: bool, error: &dyn Display) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        error!(target: TARGET, task_type, debounced, error = %error, "task handler failed");
    }

    /// A pending debounce timer was replaced before it fired.
    pub fn timer_superseded(&self, key: &str) {
        self.superseded_timers.fetch_add(1, Ordering::Relaxed);
        debug!(target: TARGET, key, "debounce timer superseded");
    }

    /// A log batch could not be persisted and was discarded.
    pub fn flush_failed(&self, batch_len: usize, error: &dyn Display) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
        self.entries_discarded
            .fetch_add(batch_len as u64, Ordering::Relaxed);
        error!(target: TARGET, batch_len, error = %error, "log batch flush failed; batch discarded");
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            unroutable_tasks: self.unroutable_tasks.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            superseded_timers: self.superseded_timers.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            entries_discarded: self.entries_discarded.load(Ordering::Relaxed),
        }
    }
}
