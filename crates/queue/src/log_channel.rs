//! Log channel: bounded, lossy queue of log entries.
//!
//! Writers never block and never see backpressure. When the buffer is at capacity the
//! **oldest** buffered entry is evicted to admit the new one; evictions are counted in
//! `dropped()`. Losing old diagnostic lines under extreme load is accepted, blocking a
//! request is not.
//!
//! There is exactly one `LogReader` (single consumer) and any number of `LogWriter`s.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The caller's token fired before an entry arrived.
    #[error("log read cancelled")]
    Cancelled,
    /// The channel is closed and empty.
    #[error("log channel is closed")]
    Closed,
}

#[derive(Debug)]
struct Shared {
    buffer: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    readable: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_one();
    }
}

/// Producer side of the log channel.
#[derive(Debug, Clone)]
pub struct LogWriter {
    shared: Arc<Shared>,
}

/// Consumer side of the log channel.
#[derive(Debug)]
pub struct LogReader {
    shared: Arc<Shared>,
}

/// Create a drop-oldest channel holding at most `capacity` entries (minimum 1).
pub fn log_channel(capacity: usize) -> (LogWriter, LogReader) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        capacity,
        readable: Notify::new(),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });

    (
        LogWriter {
            shared: shared.clone(),
        },
        LogReader { shared },
    )
}

impl LogWriter {
    /// Buffer an entry without blocking, evicting the oldest entry when full.
    ///
    /// Returns `false` only if the channel has been closed.
    pub fn try_write(&self, entry: LogEntry) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }

        {
            let mut buffer = self.shared.buffer.lock();
            if buffer.len() >= self.shared.capacity {
                buffer.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(entry);
        }

        self.shared.readable.notify_one();
        true
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries evicted by overflow since the channel was created.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl LogReader {
    /// Wait for the next entry.
    ///
    /// Fails with `Cancelled` as soon as `cancel` fires (even if entries are buffered),
    /// and with `Closed` once the channel is closed and drained.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<LogEntry, ReadError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ReadError::Cancelled);
            }
            if let Some(entry) = self.try_read() {
                return Ok(entry);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ReadError::Closed);
            }

            // Single consumer: a notify_one issued while we were not waiting is kept as a
            // permit, so no wakeup is lost between the checks above and this await.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReadError::Cancelled),
                _ = self.shared.readable.notified() => {}
            }
        }
    }

    /// Take the oldest buffered entry, if any.
    pub fn try_read(&self) -> Option<LogEntry> {
        self.shared.buffer.lock().pop_front()
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
