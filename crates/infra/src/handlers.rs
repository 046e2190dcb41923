//! Built-in task handlers and the production routing table.
//!
//! | Task type | Mode | Effect |
//! |-----------|------|--------|
//! | `InsertAnalyticalLayerResults` | debounced | runs `insert_analytical_layer_results` |
//! | `LogException` | immediate | persists one log row |
//! | `AnalyzeCityByCityId` | immediate | runs `analyze_city_by_city_id` for the item's city |

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use cityscore_core::{TaskError, TaskResult};
use cityscore_queue::{LogEntry, LogLevel, TaskType, WorkItem};

use crate::dispatcher::{TaskHandler, TaskRouter};
use crate::persistence::{ComputationArgs, ComputationRunner, LogStore};

pub const ANALYTICAL_LAYER_PROCEDURE: &str = "insert_analytical_layer_results";
pub const ANALYZE_CITY_PROCEDURE: &str = "analyze_city_by_city_id";

/// Recomputes the analytical layer. Takes no arguments; the item only signals that
/// source data changed.
pub struct AnalyticalLayerHandler {
    runner: Arc<dyn ComputationRunner>,
}

impl AnalyticalLayerHandler {
    pub fn new(runner: Arc<dyn ComputationRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TaskHandler for AnalyticalLayerHandler {
    async fn handle(&self, _item: &WorkItem) -> TaskResult {
        self.runner
            .run(ANALYTICAL_LAYER_PROCEDURE, ComputationArgs::new())
            .await?;
        Ok(())
    }
}

/// Writes an exception report straight to the log store as a single-row batch.
pub struct LogExceptionHandler {
    store: Arc<dyn LogStore>,
}

impl LogExceptionHandler {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for LogExceptionHandler {
    async fn handle(&self, item: &WorkItem) -> TaskResult {
        if item.message().is_none() && item.exception().is_none() {
            return Err(TaskError::invalid_payload(
                TaskType::LogException.as_str(),
                "neither message nor exception is set",
            ));
        }

        let level = item.level().map_or(LogLevel::Error, LogLevel::parse_lenient);
        let entry = LogEntry::new(
            level,
            item.message().unwrap_or_default(),
            item.exception().map(str::to_string),
        );
        self.store.persist_batch(std::slice::from_ref(&entry)).await?;
        Ok(())
    }
}

/// Runs the AI analysis for one city.
pub struct AnalyzeCityHandler {
    runner: Arc<dyn ComputationRunner>,
}

impl AnalyzeCityHandler {
    pub fn new(runner: Arc<dyn ComputationRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TaskHandler for AnalyzeCityHandler {
    async fn handle(&self, item: &WorkItem) -> TaskResult {
        let city_id = item.city_id().ok_or_else(|| {
            TaskError::invalid_payload(TaskType::AnalyzeCityByCityId.as_str(), "city_id is missing")
        })?;

        let mut args = ComputationArgs::new();
        args.insert("city_id".into(), json!(city_id.get()));
        args.insert("user_id".into(), json!(item.user_id().map(|u| u.get())));
        args.insert("city_enable".into(), json!(item.city_enable()));
        args.insert("pillar_enable".into(), json!(item.pillar_enable()));
        args.insert("question_enable".into(), json!(item.question_enable()));

        self.runner.run(ANALYZE_CITY_PROCEDURE, args).await?;
        Ok(())
    }
}

/// Routing table with the three built-in task types.
pub fn default_router(runner: Arc<dyn ComputationRunner>, store: Arc<dyn LogStore>) -> TaskRouter {
    TaskRouter::builder()
        .debounced(
            TaskType::InsertAnalyticalLayerResults,
            AnalyticalLayerHandler::new(runner.clone()),
        )
        .immediate(TaskType::LogException, LogExceptionHandler::new(store))
        .immediate(TaskType::AnalyzeCityByCityId, AnalyzeCityHandler::new(runner))
        .build()
}

#[cfg(test)]
mod tests {
    use cityscore_core::{CityId, StoreError, UserId};

    use super::*;
    use crate::dispatcher::DispatchMode;
    use crate::persistence::{InMemoryComputationRunner, InMemoryLogStore};

    #[test]
    fn default_router_registers_builtin_types() {
        let router = default_router(
            Arc::new(InMemoryComputationRunner::new()),
            Arc::new(InMemoryLogStore::new()),
        );

        assert_eq!(
            router.task_types(),
            vec!["AnalyzeCityByCityId", "InsertAnalyticalLayerResults", "LogException"]
        );
        let mode = |t: TaskType| router.route(&t).map(|r| r.mode());
        assert_eq!(mode(TaskType::InsertAnalyticalLayerResults), Some(DispatchMode::Debounced));
        assert_eq!(mode(TaskType::LogException), Some(DispatchMode::Immediate));
        assert_eq!(mode(TaskType::AnalyzeCityByCityId), Some(DispatchMode::Immediate));
    }

    #[tokio::test]
    async fn analytical_layer_runs_the_procedure() {
        let runner = Arc::new(InMemoryComputationRunner::new());
        let handler = AnalyticalLayerHandler::new(runner.clone());

        handler
            .handle(&WorkItem::analytical_layer_refresh())
            .await
            .unwrap();

        assert_eq!(runner.count(ANALYTICAL_LAYER_PROCEDURE), 1);
    }

    #[tokio::test]
    async fn log_exception_persists_one_row() {
        let store = Arc::new(InMemoryLogStore::new());
        let handler = LogExceptionHandler::new(store.clone());

        let item = WorkItem::log_exception("warn", "upload failed", "IOException: disk full");
        handler.handle(&item).await.unwrap();

        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level(), LogLevel::Warning);
        assert_eq!(entries[0].message(), "upload failed");
        assert_eq!(entries[0].exception(), Some("IOException: disk full"));
    }

    #[tokio::test]
    async fn log_exception_defaults_to_error_level() {
        let store = Arc::new(InMemoryLogStore::new());
        let handler = LogExceptionHandler::new(store.clone());

        let item = WorkItem::new(TaskType::LogException).with_exception("NullReference");
        handler.handle(&item).await.unwrap();

        assert_eq!(store.entries()[0].level(), LogLevel::Error);
        assert_eq!(store.entries()[0].message(), "");
    }

    #[tokio::test]
    async fn log_exception_rejects_empty_payload() {
        let handler = LogExceptionHandler::new(Arc::new(InMemoryLogStore::new()));
        let err = handler
            .handle(&WorkItem::new(TaskType::LogException))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn store_failures_surface_as_task_errors() {
        let store = Arc::new(InMemoryLogStore::new());
        store.set_failing(true);
        let handler = LogExceptionHandler::new(store);

        let err = handler
            .handle(&WorkItem::log_exception("error", "m", "e"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn analyze_city_passes_arguments() {
        let runner = Arc::new(InMemoryComputationRunner::new());
        let handler = AnalyzeCityHandler::new(runner.clone());

        let item = WorkItem::analyze_city(CityId::new(42), Some(UserId::new(7)))
            .with_scopes(true, false, true);
        handler.handle(&item).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let (name, args) = &calls[0];
        assert_eq!(name, ANALYZE_CITY_PROCEDURE);
        assert_eq!(args["city_id"], json!(42));
        assert_eq!(args["user_id"], json!(7));
        assert_eq!(args["city_enable"], json!(true));
        assert_eq!(args["pillar_enable"], json!(false));
        assert_eq!(args["question_enable"], json!(true));
    }

    #[tokio::test]
    async fn analyze_city_requires_a_city() {
        let runner = Arc::new(InMemoryComputationRunner::new());
        let handler = AnalyzeCityHandler::new(runner.clone());

        let err = handler
            .handle(&WorkItem::new(TaskType::AnalyzeCityByCityId))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidPayload { .. }));
        assert!(runner.calls().is_empty());
    }
}
