//! Outbound persistence boundary.
//!
//! The workers only know these two traits. What a "log batch insert" or a "named
//! computation" does inside the database is not their concern; they see a slow call that
//! may fail, and they bound it with a timeout.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};

use cityscore_core::StoreError;
use cityscore_queue::LogEntry;

pub use in_memory::{InMemoryComputationRunner, InMemoryLogStore};
pub use postgres::{PostgresComputationRunner, PostgresLogStore};

/// Named arguments passed to a computation.
pub type ComputationArgs = Map<String, JsonValue>;

/// Durable sink for batches of application log entries.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Persist every entry of `entries` in a single call (all or nothing).
    async fn persist_batch(&self, entries: &[LogEntry]) -> Result<(), StoreError>;
}

/// Runs a stored computation (aggregation, analysis) by symbolic name.
#[async_trait]
pub trait ComputationRunner: Send + Sync + 'static {
    async fn run(&self, name: &str, args: ComputationArgs) -> Result<(), StoreError>;
}
