//! Process-level wiring of the background pipeline.
//!
//! `Pipeline::start` creates both channels, spawns the task dispatcher and the log batcher
//! under one shutdown token, and returns the facade request handlers use:
//!
//! - `enqueue_work(item)`: fire-and-forget background work
//! - `enqueue_log(level, message, exception)`: fire-and-forget application log line
//!
//! Neither call blocks or fails visibly; both return `false` once the pipeline has been
//! shut down.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cityscore_infra::dispatcher::{DispatcherHandle, DispatcherStats, TaskDispatcher, TaskRouter};
use cityscore_infra::log_batcher::{BatcherStats, LogBatcher, LogBatcherHandle};
use cityscore_infra::persistence::postgres::{self, PostgresComputationRunner, PostgresLogStore};
use cityscore_infra::persistence::{
    ComputationRunner, InMemoryComputationRunner, InMemoryLogStore, LogStore,
};
use cityscore_infra::{PipelineConfig, default_router};
use cityscore_observability::{Diagnostics, DiagnosticsSnapshot};
use cityscore_queue::{
    LogEntry, LogLevel, LogWriter, WorkItem, WorkReceiver, WorkSender, log_channel, work_channel,
};

pub use cityscore_core::{CityId, UserId};
pub use cityscore_queue::TaskType;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// External systems the workers talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub log_store: Arc<dyn LogStore>,
    pub runner: Arc<dyn ComputationRunner>,
}

impl Collaborators {
    pub fn new(log_store: Arc<dyn LogStore>, runner: Arc<dyn ComputationRunner>) -> Self {
        Self { log_store, runner }
    }

    /// Collaborators that keep everything in memory (local runs without a database).
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryLogStore::new()),
            Arc::new(InMemoryComputationRunner::new()),
        )
    }

    /// Postgres-backed collaborators sharing one connection pool.
    pub async fn postgres(database_url: &str) -> Result<Self> {
        let pool = postgres::connect(database_url, DEFAULT_MAX_CONNECTIONS)
            .await
            .context("failed to connect to postgres")?;
        Ok(Self::new(
            Arc::new(PostgresLogStore::new(pool.clone())),
            Arc::new(PostgresComputationRunner::new(pool)),
        ))
    }
}

impl core::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Cloneable producer side of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineClient {
    work: WorkSender,
    logs: LogWriter,
}

impl PipelineClient {
    /// Queue background work. Returns `false` only after shutdown.
    pub fn enqueue_work(&self, item: WorkItem) -> bool {
        self.work.enqueue(item).is_ok()
    }

    /// Queue an application log line. Never blocks; under overflow the oldest buffered
    /// line is dropped. Returns `false` only after shutdown.
    pub fn enqueue_log(
        &self,
        level: impl Into<LogLevel>,
        message: impl Into<String>,
        exception: Option<String>,
    ) -> bool {
        self.logs.try_write(LogEntry::new(level, message, exception))
    }

    /// Work items waiting for the dispatcher.
    pub fn work_backlog(&self) -> usize {
        self.work.len()
    }

    /// Log lines waiting for the batcher.
    pub fn log_backlog(&self) -> usize {
        self.logs.len()
    }

    /// Log lines evicted by overflow so far.
    pub fn dropped_logs(&self) -> u64 {
        self.logs.dropped()
    }
}

/// Final counters, returned by `Pipeline::shutdown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub dispatcher: DispatcherStats,
    pub batcher: BatcherStats,
    pub diagnostics: DiagnosticsSnapshot,
    pub dropped_logs: u64,
}

/// Running background pipeline.
#[derive(Debug)]
pub struct Pipeline {
    client: PipelineClient,
    work_rx: WorkReceiver,
    shutdown: CancellationToken,
    diagnostics: Arc<Diagnostics>,
    dispatcher: DispatcherHandle,
    batcher: LogBatcherHandle,
    config: PipelineConfig,
}

impl Pipeline {
    /// Start the pipeline with the built-in routing table.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: PipelineConfig, collaborators: Collaborators) -> Result<Self> {
        let router = default_router(collaborators.runner, collaborators.log_store.clone());
        Self::start_with_router(config, router, collaborators.log_store)
    }

    /// Start the pipeline with a caller-supplied routing table.
    pub fn start_with_router(
        config: PipelineConfig,
        router: TaskRouter,
        log_store: Arc<dyn LogStore>,
    ) -> Result<Self> {
        config.validate().context("invalid pipeline configuration")?;
        tokio::runtime::Handle::try_current()
            .context("the pipeline must be started inside a tokio runtime")?;

        let shutdown = CancellationToken::new();
        let diagnostics = Arc::new(Diagnostics::new());
        let (work, work_rx) = work_channel();
        let (logs, log_rx) = log_channel(config.log_channel_capacity);

        let routes = router.len();
        let dispatcher = TaskDispatcher::new(router, work_rx.clone(), diagnostics.clone())
            .spawn(config.dispatcher(), shutdown.clone());
        let batcher = LogBatcher::new(log_rx, log_store, diagnostics.clone())
            .spawn(config.log_batcher(), shutdown.clone());

        info!(routes, config = ?config, "pipeline started");

        Ok(Self {
            client: PipelineClient { work, logs },
            work_rx,
            shutdown,
            diagnostics,
            dispatcher,
            batcher,
            config,
        })
    }

    /// A producer handle that can be cloned into request handlers.
    pub fn client(&self) -> PipelineClient {
        self.client.clone()
    }

    pub fn enqueue_work(&self, item: WorkItem) -> bool {
        self.client.enqueue_work(item)
    }

    pub fn enqueue_log(
        &self,
        level: impl Into<LogLevel>,
        message: impl Into<String>,
        exception: Option<String>,
    ) -> bool {
        self.client.enqueue_log(level, message, exception)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub fn batcher_stats(&self) -> BatcherStats {
        self.batcher.stats()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Keys with a pending debounce timer.
    pub fn pending_debounce_keys(&self) -> Vec<String> {
        self.dispatcher.debounce().pending_keys()
    }

    /// Stop accepting input, cancel pending debounced work, drain buffered logs within
    /// the shutdown grace and wait for both workers.
    pub async fn shutdown(self) -> PipelineReport {
        info!("pipeline shutting down");
        self.work_rx.close();
        self.client.logs.close();
        self.shutdown.cancel();

        let dispatcher = self.dispatcher.shutdown().await;
        let batcher = self.batcher.shutdown().await;
        let report = PipelineReport {
            dispatcher,
            batcher,
            diagnostics: self.diagnostics.snapshot(),
            dropped_logs: self.client.logs.dropped(),
        };
        info!(report = ?report, "pipeline stopped");
        report
    }
}
