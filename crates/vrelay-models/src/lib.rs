//! Shared data models for the vrelay pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, stages and job status
//! - The typed upload context carried from enqueue time to the upload worker

pub mod context;
pub mod job;

// Re-export common types
pub use context::{ContextError, UploadContext};
pub use job::{Job, JobId, JobPayload, JobStatus, Stage};
