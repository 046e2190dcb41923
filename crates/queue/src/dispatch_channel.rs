//! Dispatch channel: unbounded queue of work items between producers and the dispatcher.
//!
//! ## Delivery
//!
//! - **Never blocks producers**: capacity is unbounded, `enqueue` returns immediately
//! - **FIFO per producer**: items from one sender arrive in send order; interleaving across
//!   senders is unspecified
//! - **In-memory only**: buffered items are lost if the process dies
//!
//! Any number of `WorkSender`s and `WorkReceiver`s may exist. Receivers share one underlying
//! queue (each item is handed to exactly one consumer), so cloning a receiver adds a
//! competing consumer rather than a subscriber.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The channel was closed; the item was not accepted.
    #[error("dispatch channel is closed")]
    Closed,
}

#[derive(Debug)]
struct Shared {
    depth: AtomicUsize,
    closed: CancellationToken,
}

/// Producer side of the dispatch channel.
#[derive(Debug, Clone)]
pub struct WorkSender {
    tx: mpsc::UnboundedSender<WorkItem>,
    shared: Arc<Shared>,
}

/// Consumer side of the dispatch channel.
#[derive(Debug, Clone)]
pub struct WorkReceiver {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    shared: Arc<Shared>,
}

/// Create a connected sender/receiver pair.
pub fn work_channel() -> (WorkSender, WorkReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        depth: AtomicUsize::new(0),
        closed: CancellationToken::new(),
    });

    (
        WorkSender {
            tx,
            shared: shared.clone(),
        },
        WorkReceiver {
            rx: Arc::new(Mutex::new(rx)),
            shared,
        },
    )
}

impl WorkSender {
    /// Hand an item to the dispatcher.
    ///
    /// Never blocks. Fails only once the channel has been closed; callers treat the
    /// enqueue as best-effort and may ignore the error.
    pub fn enqueue(&self, item: WorkItem) -> Result<(), EnqueueError> {
        if self.shared.closed.is_cancelled() {
            return Err(EnqueueError::Closed);
        }

        // Count before sending so a fast consumer can never observe a negative depth.
        self.shared.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(item).is_err() {
            self.shared.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(EnqueueError::Closed);
        }
        Ok(())
    }

    /// Number of buffered items not yet dequeued.
    pub fn len(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled() || self.tx.is_closed()
    }
}

impl WorkReceiver {
    /// Wait for the next item.
    ///
    /// Returns `None` once the channel is closed (or every sender is gone) and all
    /// buffered items have been handed out.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        let mut rx = self.rx.lock().await;

        let item = if self.shared.closed.is_cancelled() {
            rx.try_recv().ok()
        } else {
            tokio::select! {
                biased;
                item = rx.recv() => item,
                _ = self.shared.closed.cancelled() => rx.try_recv().ok(),
            }
        };

        if item.is_some() {
            self.shared.depth.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    /// Stop accepting new items. Items already buffered remain readable.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn len(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
