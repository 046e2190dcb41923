//! Shared plumbing for the background workers.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle to control and join a background worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(name: impl Into<String>, shutdown: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            match join.await {
                Ok(()) => info!(worker = %self.name, "worker stopped"),
                Err(err) => warn!(worker = %self.name, error = %err, "worker task ended abnormally"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_cancels_and_joins() {
        let token = CancellationToken::new();
        let observed = token.clone();
        let join = tokio::spawn(async move { observed.cancelled().await });

        let handle = WorkerHandle::new("test-worker", token.clone(), join);
        assert_eq!(handle.name(), "test-worker");
        assert!(!handle.is_finished());

        handle.shutdown().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn panicking_worker_is_joined_without_propagating() {
        let fail = true;
        let join = tokio::spawn(async move {
            if fail {
                panic!("worker bug");
            }
        });
        let handle = WorkerHandle::new("doomed", CancellationToken::new(), join);
        handle.shutdown().await;
    }
}
