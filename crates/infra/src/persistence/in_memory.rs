//! In-memory collaborators for tests/dev.
//!
//! Both record every call and support failure injection so worker recovery paths can be
//! exercised without a database.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use cityscore_core::StoreError;
use cityscore_queue::LogEntry;

use super::{ComputationArgs, ComputationRunner, LogStore};

/// Shared failure switch: fail the next `n` calls, or every call while `always` is set.
#[derive(Debug, Default)]
struct FailureInjector {
    fail_next: AtomicUsize,
    always: AtomicBool,
}

impl FailureInjector {
    fn should_fail(&self) -> bool {
        if self.always.load(Ordering::Acquire) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Log store that keeps every persisted batch in memory.
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    batches: Mutex<Vec<Vec<LogEntry>>>,
    attempts: AtomicUsize,
    failures: FailureInjector,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` flush calls with `StoreError::Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failures.fail_next.store(n, Ordering::Release);
    }

    /// Fail every call until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.failures.always.store(failing, Ordering::Release);
    }

    /// Delay each call by `latency` (simulates a slow database).
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Successfully persisted batches, in flush order.
    pub fn batches(&self) -> Vec<Vec<LogEntry>> {
        self.batches.lock().clone()
    }

    /// All successfully persisted entries, flattened.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Number of `persist_batch` calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn persist_batch(&self, entries: &[LogEntry]) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.failures.should_fail() {
            return Err(StoreError::unavailable("injected log store failure"));
        }

        self.batches.lock().push(entries.to_vec());
        Ok(())
    }
}

/// Computation runner that records invocations instead of executing them.
#[derive(Debug, Default)]
pub struct InMemoryComputationRunner {
    calls: Mutex<Vec<(String, ComputationArgs)>>,
    failures: FailureInjector,
}

impl InMemoryComputationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.fail_next.store(n, Ordering::Release);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failures.always.store(failing, Ordering::Release);
    }

    /// Successful invocations, in call order.
    pub fn calls(&self) -> Vec<(String, ComputationArgs)> {
        self.calls.lock().clone()
    }

    /// Number of successful invocations of `name`.
    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|(n, _)| n == name).count()
    }
}

#[async_trait]
impl ComputationRunner for InMemoryComputationRunner {
    async fn run(&self, name: &str, args: ComputationArgs) -> Result<(), StoreError> {
        if self.failures.should_fail() {
            return Err(StoreError::rejected(format!("injected failure running {name}")));
        }
        self.calls.lock().push((name.to_string(), args));
        Ok(())
    }
}
