//! Background task dispatch.
//!
//! - `router`: immutable task type → handler table
//! - `debounce`: per-key trailing-edge timers for coalescible work
//! - `worker`: the dispatcher loop consuming the dispatch channel

pub mod debounce;
pub mod router;
pub mod worker;

pub use debounce::DebounceRegistry;
pub use router::{
    DispatchMode, FnHandler, Route, TaskHandler, TaskRouter, TaskRouterBuilder, handler_fn,
};
pub use worker::{DispatcherConfig, DispatcherHandle, DispatcherStats, TaskDispatcher};
