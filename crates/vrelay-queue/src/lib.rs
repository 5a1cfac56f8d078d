//! Dependency-aware job queue.
//!
//! This crate provides:
//! - The [`JobBackend`] interface: per-stage queues, persisted results,
//!   deferred dependents and a failure record
//! - [`JobQueue`], backed by Redis Streams
//! - [`MemoryQueue`], an in-process backend for tests

pub mod backend;
pub mod error;
pub mod memory;
pub mod queue;

pub use backend::{FailureRecord, JobBackend, Reservation};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueue;
pub use queue::{JobQueue, QueueConfig};
