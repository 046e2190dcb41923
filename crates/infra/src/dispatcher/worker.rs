//! Task dispatcher worker.
//!
//! Dequeues work items, routes them by task type and either runs the handler inline
//! (`Immediate`) or hands the invocation to the debounce registry (`Debounced`).
//!
//! Execution within the worker is sequential: an immediate handler is awaited before the
//! next item is dequeued. Every handler call is bounded by `handler_timeout`, and a
//! failure, timeout or panic is reported to diagnostics without stopping the loop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use cityscore_core::{TaskError, TaskResult};
use cityscore_observability::Diagnostics;
use cityscore_queue::{WorkItem, WorkReceiver};

use super::debounce::DebounceRegistry;
use super::router::{DispatchMode, TaskHandler, TaskRouter};
use crate::workers::WorkerHandle;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Quiet period for debounced task types.
    pub debounce_window: Duration,
    /// Upper bound for one handler invocation.
    pub handler_timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(120),
            handler_timeout: Duration::from_secs(10),
            name: "task-dispatcher".to_string(),
        }
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Items taken off the dispatch channel.
    pub processed: u64,
    /// Handler invocations that completed successfully (immediate and debounced).
    pub succeeded: u64,
    /// Handler invocations that failed, timed out or panicked.
    pub failed: u64,
    /// Items dropped because no handler was registered.
    pub unroutable: u64,
    /// Items handed to the debounce registry.
    pub debounced: u64,
    /// Items still queued when the loop stopped on shutdown; never dispatched.
    pub abandoned: u64,
}

type SharedStats = Arc<Mutex<DispatcherStats>>;

/// Handle to a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    worker: WorkerHandle,
    stats: SharedStats,
    debounce: Arc<DebounceRegistry>,
}

impl DispatcherHandle {
    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().clone()
    }

    /// Pending debounce timers, for inspection.
    pub fn debounce(&self) -> &DebounceRegistry {
        &self.debounce
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Stop the loop and wait for it. An in-flight handler is allowed to finish; pending
    /// debounce timers are cancelled. Returns the final statistics.
    pub async fn shutdown(self) -> DispatcherStats {
        self.worker.shutdown().await;
        self.stats.lock().clone()
    }
}

/// Background task dispatcher.
pub struct TaskDispatcher {
    router: TaskRouter,
    receiver: WorkReceiver,
    diagnostics: Arc<Diagnostics>,
}

impl TaskDispatcher {
    pub fn new(router: TaskRouter, receiver: WorkReceiver, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            router,
            receiver,
            diagnostics,
        }
    }

    /// Spawn the dispatcher loop on the current tokio runtime.
    ///
    /// The loop stops when `shutdown` is cancelled or the dispatch channel is closed and
    /// drained.
    pub fn spawn(self, config: DispatcherConfig, shutdown: CancellationToken) -> DispatcherHandle {
        let shutdown = shutdown.child_token();
        let stats = SharedStats::default();
        let debounce = Arc::new(DebounceRegistry::new(
            shutdown.clone(),
            self.diagnostics.clone(),
        ));

        let name = config.name.clone();
        let join = tokio::spawn(dispatcher_loop(
            self,
            config,
            shutdown.clone(),
            stats.clone(),
            debounce.clone(),
        ));

        DispatcherHandle {
            worker: WorkerHandle::new(name, shutdown, join),
            stats,
            debounce,
        }
    }
}

async fn dispatcher_loop(
    dispatcher: TaskDispatcher,
    config: DispatcherConfig,
    shutdown: CancellationToken,
    stats: SharedStats,
    debounce: Arc<DebounceRegistry>,
) {
    info!(
        worker = %config.name,
        routes = dispatcher.router.len(),
        debounce_window_ms = config.debounce_window.as_millis() as u64,
        "task dispatcher started"
    );

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(worker = %config.name, "task dispatcher shutting down");
                break;
            }
            next = dispatcher.receiver.dequeue() => match next {
                Some(item) => item,
                None => {
                    info!(worker = %config.name, "dispatch channel closed, task dispatcher stopping");
                    break;
                }
            },
        };

        stats.lock().processed += 1;
        dispatch_one(&dispatcher, &config, &stats, &debounce, item).await;
    }

    let abandoned = dispatcher.receiver.len();
    if abandoned > 0 {
        stats.lock().abandoned += abandoned as u64;
        warn!(worker = %config.name, abandoned, "work items left queued at shutdown");
    }

    let cancelled = debounce.cancel_all();
    if cancelled > 0 {
        debug!(worker = %config.name, cancelled, "cancelled pending debounce timers");
    }
    info!(worker = %config.name, stats = ?*stats.lock(), "task dispatcher stopped");
}

#[instrument(
    skip_all,
    fields(worker = %config.name, task_type = %item.task_type(), item_id = %item.id())
)]
async fn dispatch_one(
    dispatcher: &TaskDispatcher,
    config: &DispatcherConfig,
    stats: &SharedStats,
    debounce: &DebounceRegistry,
    item: WorkItem,
) {
    let Some(route) = dispatcher.router.route(item.task_type()) else {
        stats.lock().unroutable += 1;
        dispatcher
            .diagnostics
            .unroutable(item.task_type().as_str(), &item.id());
        return;
    };

    match route.mode() {
        DispatchMode::Immediate => {
            let result = invoke(route.handler().clone(), item.clone(), config.handler_timeout).await;
            record(stats, &dispatcher.diagnostics, item.task_type().as_str(), result);
        }
        DispatchMode::Debounced => {
            let key = item.task_type().as_str().to_string();
            let handler = route.handler().clone();
            let timeout = config.handler_timeout;
            let stats_for_timer = stats.clone();

            let scheduled = debounce.schedule(key, config.debounce_window, move || async move {
                let result = invoke(handler, item, timeout).await;
                match &result {
                    Ok(()) => stats_for_timer.lock().succeeded += 1,
                    Err(_) => stats_for_timer.lock().failed += 1,
                }
                // The registry reports the error to diagnostics.
                result
            });

            if scheduled {
                stats.lock().debounced += 1;
            }
        }
    }
}

/// Run one handler invocation on its own task, bounded by `timeout`.
///
/// A panicking handler surfaces as `TaskError::Failed` instead of unwinding into the
/// caller. A timed-out handler is aborted, and has stopped, by the time this returns.
async fn invoke(handler: Arc<dyn TaskHandler>, item: WorkItem, timeout: Duration) -> TaskResult {
    let mut task = tokio::spawn(async move { handler.handle(&item).await });
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(TaskError::failed(format!("handler panicked: {join_err}"))),
        Err(_) => {
            task.abort();
            // Resolves once the handler future has been dropped.
            let _ = task.await;
            Err(TaskError::Timeout(timeout))
        }
    }
}

fn record(
    stats: &SharedStats,
    diagnostics: &Diagnostics,
    task_type: &str,
    result: TaskResult,
) {
    match result {
        Ok(()) => stats.lock().succeeded += 1,
        Err(err) => {
            stats.lock().failed += 1;
            diagnostics.handler_failed(task_type, false, &err);
        }
    }
}
