//! Integration tests for the dispatch and log-ingestion pipeline.
//!
//! Tests: producer → channels → dispatcher / batcher → in-memory collaborators
//!
//! Verifies:
//! - The production routing table drives the in-memory collaborators end to end
//! - Unroutable and failing work does not disturb other work
//! - Logging from many producers stays non-blocking while the store is down
//! - Shutdown cancels pending debounced work and drains buffered logs

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::advance;
    use tokio_util::sync::CancellationToken;

    use cityscore_core::{CityId, UserId};
    use cityscore_observability::Diagnostics;
    use cityscore_queue::{
        LogEntry, LogLevel, LogWriter, WorkItem, WorkSender, log_channel, work_channel,
    };

    use crate::config::PipelineConfig;
    use crate::dispatcher::{DispatcherHandle, TaskDispatcher};
    use crate::handlers::{ANALYTICAL_LAYER_PROCEDURE, ANALYZE_CITY_PROCEDURE, default_router};
    use crate::log_batcher::{LogBatcher, LogBatcherHandle};
    use crate::persistence::{InMemoryComputationRunner, InMemoryLogStore};

    struct Pipeline {
        work: WorkSender,
        logs: LogWriter,
        runner: Arc<InMemoryComputationRunner>,
        store: Arc<InMemoryLogStore>,
        diagnostics: Arc<Diagnostics>,
        shutdown: CancellationToken,
        dispatcher: DispatcherHandle,
        batcher: LogBatcherHandle,
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_debounce_window(Duration::from_secs(2))
            .with_log_batch(10, Duration::from_secs(1))
            .with_log_channel_capacity(100)
            .with_persist_timeout(Duration::from_secs(1))
            .with_flush_failure_backoff(Duration::from_millis(500))
    }

    fn setup(config: PipelineConfig) -> Pipeline {
        let runner = Arc::new(InMemoryComputationRunner::new());
        let store = Arc::new(InMemoryLogStore::new());
        let diagnostics = Arc::new(Diagnostics::new());
        let shutdown = CancellationToken::new();

        let (work, work_rx) = work_channel();
        let (logs, log_rx) = log_channel(config.log_channel_capacity);

        let router = default_router(runner.clone(), store.clone());
        let dispatcher = TaskDispatcher::new(router, work_rx, diagnostics.clone())
            .spawn(config.dispatcher(), shutdown.clone());
        let batcher = LogBatcher::new(log_rx, store.clone(), diagnostics.clone())
            .spawn(config.log_batcher(), shutdown.clone());

        Pipeline {
            work,
            logs,
            runner,
            store,
            diagnostics,
            shutdown,
            dispatcher,
            batcher,
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn log(n: usize) -> LogEntry {
        LogEntry::new(LogLevel::Information, format!("line-{n}"), None)
    }

    #[tokio::test(start_paused = true)]
    async fn builtin_tasks_reach_their_collaborators() {
        let p = setup(test_config());

        p.work
            .enqueue(WorkItem::analyze_city(CityId::new(11), Some(UserId::new(3))))
            .unwrap();
        p.work
            .enqueue(WorkItem::log_exception("critical", "payment sync failed", "TimeoutException"))
            .unwrap();
        for _ in 0..4 {
            p.work.enqueue(WorkItem::analytical_layer_refresh()).unwrap();
        }
        settle().await;

        assert_eq!(p.runner.count(ANALYZE_CITY_PROCEDURE), 1);
        assert_eq!(p.runner.count(ANALYTICAL_LAYER_PROCEDURE), 0);
        let rows = p.store.entries();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].level(), LogLevel::Critical);

        advance(Duration::from_millis(2_100)).await;
        settle().await;
        assert_eq!(p.runner.count(ANALYTICAL_LAYER_PROCEDURE), 1);

        let stats = p.dispatcher.stats();
        assert_eq!(stats.processed, 6);
        assert_eq!(stats.debounced, 4);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(p.diagnostics.snapshot().superseded_timers, 3);

        p.dispatcher.shutdown().await;
        p.batcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bad_work_is_isolated_from_good_work() {
        let p = setup(test_config());
        p.runner.fail_next(1);

        p.work.enqueue(WorkItem::new("RetireLegacyScores")).unwrap();
        p.work
            .enqueue(WorkItem::new(cityscore_queue::TaskType::AnalyzeCityByCityId))
            .unwrap();
        p.work
            .enqueue(WorkItem::analyze_city(CityId::new(1), None))
            .unwrap();
        p.work
            .enqueue(WorkItem::analyze_city(CityId::new(2), None))
            .unwrap();
        settle().await;

        let stats = p.dispatcher.stats();
        assert_eq!(stats.unroutable, 1);
        // Missing city id and the injected runner failure.
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(p.runner.calls()[0].1["city_id"], serde_json::json!(2));

        let snapshot = p.diagnostics.snapshot();
        assert_eq!(snapshot.unroutable_tasks, 1);
        assert_eq!(snapshot.handler_failures, 2);

        p.dispatcher.shutdown().await;
        p.batcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn logging_survives_a_store_outage() {
        let p = setup(test_config());
        p.store.set_failing(true);

        for n in 0..500 {
            assert!(p.logs.try_write(log(n)));
        }
        settle().await;
        assert!(p.logs.len() <= 100);
        assert!(p.logs.dropped() > 0);

        for _ in 0..20 {
            advance(Duration::from_millis(600)).await;
            settle().await;
        }
        assert!(p.batcher.stats().batches_failed > 0);
        assert!(p.diagnostics.snapshot().flush_failures > 0);

        p.store.set_failing(false);
        advance(Duration::from_millis(600)).await;
        settle().await;
        for n in 1_000..1_005 {
            p.logs.try_write(log(n));
        }
        advance(Duration::from_millis(1_100)).await;
        settle().await;

        let persisted: Vec<String> = p
            .store
            .entries()
            .iter()
            .map(|e| e.message().to_string())
            .collect();
        assert!(persisted.contains(&"line-1004".to_string()));
        assert!(!p.batcher.is_finished());

        p.dispatcher.shutdown().await;
        p.batcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_debounce_and_drains_logs() {
        let p = setup(test_config());

        p.work.enqueue(WorkItem::analytical_layer_refresh()).unwrap();
        for n in 0..35 {
            p.logs.try_write(log(n));
        }
        settle().await;
        assert!(p.dispatcher.debounce().is_pending("InsertAnalyticalLayerResults"));

        p.shutdown.cancel();
        p.dispatcher.shutdown().await;
        p.batcher.shutdown().await;
        advance(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(p.runner.count(ANALYTICAL_LAYER_PROCEDURE), 0);
        assert_eq!(p.store.entries().len(), 35);
    }
}
