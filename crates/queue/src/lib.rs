//! In-process queues feeding the background workers.
//!
//! - `dispatch_channel`: unbounded work queue consumed by the task dispatcher
//! - `log_channel`: bounded drop-oldest queue consumed by the log batcher
//!
//! Both are in-memory only; nothing buffered here survives a process restart.

pub mod dispatch_channel;
pub mod log_channel;
pub mod log_entry;
pub mod work_item;

pub use dispatch_channel::{EnqueueError, WorkReceiver, WorkSender, work_channel};
pub use log_channel::{LogReader, LogWriter, ReadError, log_channel};
pub use log_entry::{LogEntry, LogLevel};
pub use work_item::{TaskType, WorkItem};
