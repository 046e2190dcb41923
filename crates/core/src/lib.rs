//! `cityscore-core` — shared primitives for the background pipeline.
//!
//! This crate contains identifiers and error types only (no IO, no async).

pub mod error;
pub mod id;

pub use error::{ParseIdError, StoreError, TaskError, TaskResult};
pub use id::{CityId, UserId, WorkItemId};
