//! Job definitions for queue processing.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UploadContext;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage. Each stage has its own logical queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Audio normalization + conditional transcode
    Compress,
    /// Delivery to the storage endpoint
    Upload,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Compress, Stage::Upload];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Compress => "compress",
            Stage::Upload => "upload",
        }
    }

    /// Parse a stage name, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compress" => Some(Stage::Compress),
            "upload" => Some(Stage::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its dependency to succeed
    Deferred,
    /// Waiting in its stage queue
    #[default]
    Queued,
    /// Picked up by a worker
    Running,
    /// Finished with a recorded result
    Succeeded,
    /// Finished with a recorded error
    Failed,
    /// Removed before it started (explicitly, or because its dependency failed)
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Deferred => "deferred",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// True while the job has not been picked up by a worker.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Deferred | JobStatus::Queued)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-specific job input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Compress a staged file.
    Compress { input: PathBuf },
    /// Upload an artifact. `input` is used only when the job has no dependency
    /// result to read from.
    Upload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<PathBuf>,
        context: UploadContext,
    },
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Stage queue the job runs on
    pub stage: Stage,

    /// Job that must succeed before this one may start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<JobId>,

    /// Stage input
    pub payload: JobPayload,

    /// Job status
    #[serde(default)]
    pub status: JobStatus,

    /// Artifact path recorded on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Error message recorded on failure or cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Maximum runtime before the job is aborted
    pub timeout_secs: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Started at timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Finished at timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a compress job for a staged file.
    pub fn compress(input: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self::build(
            Stage::Compress,
            None,
            JobPayload::Compress {
                input: input.into(),
            },
            timeout_secs,
        )
    }

    /// Create an upload job that reads its input from `dependency`'s result.
    pub fn upload_after(dependency: JobId, context: UploadContext, timeout_secs: u64) -> Self {
        Self::build(
            Stage::Upload,
            Some(dependency),
            JobPayload::Upload {
                input: None,
                context,
            },
            timeout_secs,
        )
    }

    /// Create an upload job for an explicit file.
    pub fn upload_file(
        input: impl Into<PathBuf>,
        context: UploadContext,
        timeout_secs: u64,
    ) -> Self {
        Self::build(
            Stage::Upload,
            None,
            JobPayload::Upload {
                input: Some(input.into()),
                context,
            },
            timeout_secs,
        )
    }

    fn build(
        stage: Stage,
        depends_on: Option<JobId>,
        payload: JobPayload,
        timeout_secs: u64,
    ) -> Self {
        Self {
            id: JobId::new(),
            stage,
            depends_on,
            payload,
            status: JobStatus::Queued,
            result: None,
            error: None,
            timeout_secs,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Upload context, if this is an upload job.
    pub fn upload_context(&self) -> Option<&UploadContext> {
        match &self.payload {
            JobPayload::Upload { context, .. } => Some(context),
            JobPayload::Compress { .. } => None,
        }
    }

    /// Mark the job as picked up by a worker.
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Record a successful result.
    pub fn succeed(&mut self, result: impl Into<String>) {
        self.status = JobStatus::Succeeded;
        self.result = Some(result.into());
        self.ended_at = Some(Utc::now());
    }

    /// Record a failure.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
    }

    /// Cancel a job that never started.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Canceled;
        self.error = Some(reason.into());
        self.ended_at = Some(Utc::now());
    }
}
