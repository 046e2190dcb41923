//! Infrastructure layer: background workers, their collaborators and configuration.

pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod log_batcher;
pub mod persistence;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, PipelineConfig};
pub use dispatcher::{
    DispatchMode, DispatcherConfig, DispatcherHandle, DispatcherStats, TaskDispatcher,
    TaskHandler, TaskRouter,
};
pub use handlers::default_router;
pub use log_batcher::{BatcherStats, LogBatcher, LogBatcherConfig, LogBatcherHandle};
pub use persistence::{ComputationArgs, ComputationRunner, LogStore};
