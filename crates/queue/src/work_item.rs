use core::convert::Infallible;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cityscore_core::{CityId, UserId, WorkItemId};

/// Task discriminator used to route a work item to its handler.
///
/// Names outside the known set are carried as `Custom` so that an unknown type can
/// travel through the channel and be dropped by the dispatcher instead of failing
/// at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    /// Recompute the analytical layer aggregates (expensive, coalescible).
    InsertAnalyticalLayerResults,
    /// Persist an exception report as a log row.
    LogException,
    /// Run the AI analysis for a single city.
    AnalyzeCityByCityId,
    /// Any other task name.
    Custom(String),
}

impl TaskType {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::from(name.into())
    }

    /// Routing key of this task type.
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::InsertAnalyticalLayerResults => "InsertAnalyticalLayerResults",
            TaskType::LogException => "LogException",
            TaskType::AnalyzeCityByCityId => "AnalyzeCityByCityId",
            TaskType::Custom(name) => name,
        }
    }
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "InsertAnalyticalLayerResults" => TaskType::InsertAnalyticalLayerResults,
            "LogException" => TaskType::LogException,
            "AnalyzeCityByCityId" => TaskType::AnalyzeCityByCityId,
            _ => TaskType::Custom(value),
        }
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        match value {
            TaskType::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for TaskType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

/// A unit of deferred background work.
///
/// Built inline by the code that triggers the work, consumed exactly once by the
/// dispatcher. There are no setters: once built and enqueued, an item is never
/// mutated. Payload fields are optional because each task type reads only the ones
/// it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    id: WorkItemId,
    task_type: TaskType,
    enqueued_at: DateTime<Utc>,

    user_id: Option<UserId>,
    city_id: Option<CityId>,
    level: Option<String>,
    message: Option<String>,
    exception: Option<String>,

    city_enable: bool,
    pillar_enable: bool,
    question_enable: bool,
}

impl WorkItem {
    pub fn new(task_type: impl Into<TaskType>) -> Self {
        Self {
            id: WorkItemId::new(),
            task_type: task_type.into(),
            enqueued_at: Utc::now(),
            user_id: None,
            city_id: None,
            level: None,
            message: None,
            exception: None,
            city_enable: false,
            pillar_enable: false,
            question_enable: false,
        }
    }

    /// Trigger for the analytical layer recompute.
    pub fn analytical_layer_refresh() -> Self {
        Self::new(TaskType::InsertAnalyticalLayerResults)
    }

    /// Exception report to be persisted as a log row.
    pub fn log_exception(
        level: impl Into<String>,
        message: impl Into<String>,
        exception: impl Into<String>,
    ) -> Self {
        Self::new(TaskType::LogException)
            .with_level(level)
            .with_message(message)
            .with_exception(exception)
    }

    /// AI analysis request for one city.
    pub fn analyze_city(city_id: CityId, user_id: Option<UserId>) -> Self {
        let item = Self::new(TaskType::AnalyzeCityByCityId).with_city(city_id);
        match user_id {
            Some(user_id) => item.with_user(user_id),
            None => item,
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_city(mut self, city_id: CityId) -> Self {
        self.city_id = Some(city_id);
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    /// Select which analysis scopes are enabled (city, pillar, question).
    pub fn with_scopes(mut self, city: bool, pillar: bool, question: bool) -> Self {
        self.city_enable = city;
        self.pillar_enable = pillar;
        self.question_enable = question;
        self
    }

    pub fn id(&self) -> WorkItemId {
        self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn city_id(&self) -> Option<CityId> {
        self.city_id
    }

    pub fn level(&self) -> Option<&str> {
        self.level.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn city_enable(&self) -> bool {
        self.city_enable
    }

    pub fn pillar_enable(&self) -> bool {
        self.pillar_enable
    }

    pub fn question_enable(&self) -> bool {
        self.question_enable
    }
}
