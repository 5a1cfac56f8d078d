//! Compress and upload worker.
//!
//! This crate provides:
//! - The enqueue side of the pipeline (`Pipeline::submit`)
//! - Compress and upload job handlers
//! - A bounded job executor with per-job timeouts and graceful shutdown

pub mod compress_job;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pipeline;
pub mod upload_job;

pub use config::WorkerConfig;
pub use context::{DeliverySettings, WorkerContext};
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use pipeline::{Pipeline, SubmitRequest, SubmittedPipeline};
pub use upload_job::resolve_input;
