//! Log batcher worker.
//!
//! Drains the log channel into batches and persists each batch with one `LogStore` call.
//!
//! ## Cycle
//!
//! 1. Collect entries until the batch holds `batch_size` entries or `batch_timeout` has
//!    passed since the cycle started.
//! 2. Persist a non-empty batch, bounded by `persist_timeout`.
//! 3. On failure: report to diagnostics, discard the batch, pause for `failure_backoff`.
//!    A batch is never retried.
//!
//! On shutdown (or once the channel is closed and empty) the partial batch and whatever is
//! still buffered are flushed in `batch_size` chunks for at most `shutdown_grace`.
//!
//! Flush failures go to the diagnostics sink only, never back into the log channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use cityscore_core::StoreError;
use cityscore_observability::Diagnostics;
use cityscore_queue::{LogEntry, LogReader, ReadError};

use crate::persistence::LogStore;
use crate::workers::WorkerHandle;

/// Log batcher configuration.
#[derive(Debug, Clone)]
pub struct LogBatcherConfig {
    /// Flush as soon as a batch holds this many entries.
    pub batch_size: usize,
    /// Flush a non-empty batch after this long, even if not full.
    pub batch_timeout: Duration,
    /// Upper bound for one `persist_batch` call.
    pub persist_timeout: Duration,
    /// Pause after a failed flush.
    pub failure_backoff: Duration,
    /// Time allowed to drain buffered entries on shutdown.
    pub shutdown_grace: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for LogBatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout: Duration::from_secs(5),
            persist_timeout: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            name: "log-batcher".to_string(),
        }
    }
}

/// Batcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub batches_flushed: u64,
    pub entries_flushed: u64,
    pub batches_failed: u64,
    /// Entries lost to failed flushes or abandoned at shutdown.
    pub entries_discarded: u64,
}

type SharedStats = Arc<Mutex<BatcherStats>>;

/// Handle to a running log batcher.
#[derive(Debug)]
pub struct LogBatcherHandle {
    worker: WorkerHandle,
    stats: SharedStats,
}

impl LogBatcherHandle {
    pub fn stats(&self) -> BatcherStats {
        self.stats.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Stop collecting, drain what is buffered (within the shutdown grace) and wait.
    /// Returns the final statistics.
    pub async fn shutdown(self) -> BatcherStats {
        self.worker.shutdown().await;
        self.stats.lock().clone()
    }
}

/// Why a collection cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    Full,
    WindowElapsed,
    Shutdown,
    Closed,
}

/// Background log batcher.
pub struct LogBatcher {
    reader: LogReader,
    store: Arc<dyn LogStore>,
    diagnostics: Arc<Diagnostics>,
}

impl LogBatcher {
    pub fn new(reader: LogReader, store: Arc<dyn LogStore>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            reader,
            store,
            diagnostics,
        }
    }

    /// Spawn the batcher loop on the current tokio runtime.
    pub fn spawn(self, config: LogBatcherConfig, shutdown: CancellationToken) -> LogBatcherHandle {
        let shutdown = shutdown.child_token();
        let stats = SharedStats::default();
        let name = config.name.clone();

        let join = tokio::spawn(batcher_loop(self, config, shutdown.clone(), stats.clone()));

        LogBatcherHandle {
            worker: WorkerHandle::new(name, shutdown, join),
            stats,
        }
    }
}

async fn batcher_loop(
    batcher: LogBatcher,
    config: LogBatcherConfig,
    shutdown: CancellationToken,
    stats: SharedStats,
) {
    let batch_size = config.batch_size.max(1);
    info!(
        worker = %config.name,
        batch_size,
        batch_timeout_ms = config.batch_timeout.as_millis() as u64,
        capacity = batcher.reader.capacity(),
        "log batcher started"
    );

    let mut batch: Vec<LogEntry> = Vec::with_capacity(batch_size);
    loop {
        let end = collect(
            &batcher.reader,
            &mut batch,
            batch_size,
            config.batch_timeout,
            &shutdown,
        )
        .await;
        if matches!(end, CycleEnd::Shutdown | CycleEnd::Closed) {
            debug!(worker = %config.name, reason = ?end, "log batcher leaving collect loop");
            break;
        }
        if batch.is_empty() {
            continue;
        }

        let entries = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
        if !flush(&batcher, &stats, entries, config.persist_timeout).await {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(config.failure_backoff) => {}
            }
        }
    }

    drain(&batcher, &config, &stats, batch, batch_size).await;
    info!(
        worker = %config.name,
        stats = ?*stats.lock(),
        dropped_on_overflow = batcher.reader.dropped(),
        "log batcher stopped"
    );
}

/// Fill `batch` until it is full, the window elapses, shutdown fires or the channel closes.
async fn collect(
    reader: &LogReader,
    batch: &mut Vec<LogEntry>,
    batch_size: usize,
    window: Duration,
    shutdown: &CancellationToken,
) -> CycleEnd {
    let deadline = Instant::now() + window;
    while batch.len() < batch_size {
        match tokio::time::timeout_at(deadline, reader.read(shutdown)).await {
            Ok(Ok(entry)) => batch.push(entry),
            Ok(Err(ReadError::Cancelled)) => return CycleEnd::Shutdown,
            Ok(Err(ReadError::Closed)) => return CycleEnd::Closed,
            Err(_) => return CycleEnd::WindowElapsed,
        }
    }
    CycleEnd::Full
}

/// Persist one batch. Returns whether it landed; a failed batch is reported and dropped.
#[instrument(skip_all, fields(batch_len = entries.len()))]
async fn flush(
    batcher: &LogBatcher,
    stats: &SharedStats,
    entries: Vec<LogEntry>,
    timeout: Duration,
) -> bool {
    let len = entries.len();
    match persist(batcher.store.clone(), entries, timeout).await {
        Ok(()) => {
            let mut stats = stats.lock();
            stats.batches_flushed += 1;
            stats.entries_flushed += len as u64;
            true
        }
        Err(err) => {
            {
                let mut stats = stats.lock();
                stats.batches_failed += 1;
                stats.entries_discarded += len as u64;
            }
            batcher.diagnostics.flush_failed(len, &err);
            false
        }
    }
}

/// Run `persist_batch` on its own task so a panicking store cannot take the worker down.
/// A call that exceeds `timeout` is aborted before this returns, so a discarded batch is
/// never written late and at most one call is in flight.
async fn persist(
    store: Arc<dyn LogStore>,
    entries: Vec<LogEntry>,
    timeout: Duration,
) -> Result<(), StoreError> {
    let mut task = tokio::spawn(async move { store.persist_batch(&entries).await });
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(StoreError::rejected(format!(
            "log store panicked: {join_err}"
        ))),
        Err(_) => {
            task.abort();
            let _ = task.await;
            Err(StoreError::Timeout(timeout))
        }
    }
}

/// Flush the partial batch and the buffered backlog within the shutdown grace.
async fn drain(
    batcher: &LogBatcher,
    config: &LogBatcherConfig,
    stats: &SharedStats,
    mut batch: Vec<LogEntry>,
    batch_size: usize,
) {
    let deadline = Instant::now() + config.shutdown_grace;
    loop {
        while batch.len() < batch_size {
            match batcher.reader.try_read() {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        if batch.is_empty() {
            return;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let entries = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
        flush(batcher, stats, entries, config.persist_timeout.min(remaining)).await;
    }

    let abandoned = batch.len() + batcher.reader.len();
    stats.lock().entries_discarded += abandoned as u64;
    warn!(
        worker = %config.name,
        abandoned,
        grace_ms = config.shutdown_grace.as_millis() as u64,
        "shutdown grace elapsed with log entries still buffered"
    );
}
