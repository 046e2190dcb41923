//! Task routing table.
//!
//! Built once at startup with `TaskRouter::builder()` and handed to the dispatcher by
//! value; there is no global registry and nothing can be registered after `build()`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use cityscore_core::TaskResult;
use cityscore_queue::{TaskType, WorkItem};

/// Executes one kind of background work.
///
/// Handlers should be idempotent or order-tolerant: the dispatcher gives no ordering
/// guarantee across producers, and debounced work runs once per burst.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, item: &WorkItem) -> TaskResult;
}

/// Adapter turning an async closure into a `TaskHandler`.
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler. The closure receives its own copy of the item.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn handle(&self, item: &WorkItem) -> TaskResult {
        (self.0)(item.clone()).await
    }
}

/// How the dispatcher runs a task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Run inside the dispatcher loop, once per item.
    Immediate,
    /// Coalesce bursts: run once after the debounce window has passed with no new item.
    Debounced,
}

#[derive(Clone)]
pub struct Route {
    handler: Arc<dyn TaskHandler>,
    mode: DispatchMode,
}

impl Route {
    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }
}

impl core::fmt::Debug for Route {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Route").field("mode", &self.mode).finish_non_exhaustive()
    }
}

/// Immutable map from task type to handler.
#[derive(Debug, Clone, Default)]
pub struct TaskRouter {
    routes: HashMap<String, Route>,
}

impl TaskRouter {
    pub fn builder() -> TaskRouterBuilder {
        TaskRouterBuilder::default()
    }

    /// Look up the route for a task type. `None` means the item is unroutable.
    pub fn route(&self, task_type: &TaskType) -> Option<&Route> {
        self.routes.get(task_type.as_str())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered task type names, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Default)]
pub struct TaskRouterBuilder {
    routes: HashMap<String, Route>,
}

impl TaskRouterBuilder {
    /// Run `handler` immediately for every item of `task_type`.
    pub fn immediate<H>(self, task_type: impl Into<TaskType>, handler: H) -> Self
    where
        H: TaskHandler,
    {
        self.insert(task_type.into(), Arc::new(handler), DispatchMode::Immediate)
    }

    /// Coalesce items of `task_type` through the debounce registry.
    pub fn debounced<H>(self, task_type: impl Into<TaskType>, handler: H) -> Self
    where
        H: TaskHandler,
    {
        self.insert(task_type.into(), Arc::new(handler), DispatchMode::Debounced)
    }

    /// Register an already shared handler. A later registration for the same type wins.
    pub fn insert(
        mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
        mode: DispatchMode,
    ) -> Self {
        self.routes
            .insert(task_type.as_str().to_string(), Route { handler, mode });
        self
    }

    pub fn build(self) -> TaskRouter {
        TaskRouter {
            routes: self.routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler() -> impl TaskHandler {
        handler_fn(|_item| async { Ok(()) })
    }

    #[test]
    fn routes_by_task_type_name() {
        let router = TaskRouter::builder()
            .immediate(TaskType::LogException, ok_handler())
            .debounced("InsertAnalyticalLayerResults", ok_handler())
            .immediate(TaskType::custom("RebuildScores"), ok_handler())
            .build();

        assert_eq!(router.len(), 3);
        assert_eq!(
            router.route(&TaskType::InsertAnalyticalLayerResults).map(Route::mode),
            Some(DispatchMode::Debounced)
        );
        assert_eq!(
            router.route(&TaskType::from("RebuildScores")).map(Route::mode),
            Some(DispatchMode::Immediate)
        );
        assert!(router.route(&TaskType::AnalyzeCityByCityId).is_none());
        assert_eq!(
            router.task_types(),
            vec!["InsertAnalyticalLayerResults", "LogException", "RebuildScores"]
        );
    }

    #[test]
    fn later_registration_replaces_earlier_one() {
        let router = TaskRouter::builder()
            .immediate(TaskType::LogException, ok_handler())
            .debounced(TaskType::LogException, ok_handler())
            .build();

        assert_eq!(router.len(), 1);
        assert_eq!(
            router.route(&TaskType::LogException).map(Route::mode),
            Some(DispatchMode::Debounced)
        );
    }

    #[tokio::test]
    async fn fn_handler_receives_the_item() {
        let handler = handler_fn(|item: WorkItem| async move {
            match item.message() {
                Some("ok") => Ok(()),
                _ => Err(cityscore_core::TaskError::failed("unexpected message")),
            }
        });

        let item = WorkItem::new("X").with_message("ok");
        assert!(handler.handle(&item).await.is_ok());
        assert!(handler.handle(&WorkItem::new("X")).await.is_err());
    }
}
