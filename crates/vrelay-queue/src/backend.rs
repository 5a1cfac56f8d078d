//! Backend-agnostic queue interface.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vrelay_models::{Job, JobId, JobStatus, Stage};

use crate::error::{QueueError, QueueResult};

/// A job handed to a worker. Must be settled with `complete` or `fail`.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Backend-specific delivery handle (stream entry ID for Redis)
    pub delivery_id: String,
    pub job: Job,
}

/// Entry appended to the failure record when a job fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_id: JobId,
    pub stage: Stage,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(job: &Job, error: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            stage: job.stage,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Durable job queue with one logical queue per stage and a persisted
/// result per job.
///
/// A job with `depends_on` is held back until its dependency succeeds. When
/// the dependency fails or is canceled, the dependent is canceled and never
/// runs.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Store and (when runnable) dispatch a job. Returns the stored record.
    async fn submit(&self, job: Job) -> QueueResult<Job>;

    /// Take up to `count` queued jobs from `stages`, waiting at most `block`.
    /// Returned jobs are marked running.
    async fn reserve(
        &self,
        consumer: &str,
        stages: &[Stage],
        block: Duration,
        count: usize,
    ) -> QueueResult<Vec<Reservation>>;

    /// Record success and release dependents.
    async fn complete(&self, reservation: &Reservation, result: &str) -> QueueResult<()>;

    /// Record failure, append to the failure record and cancel dependents.
    async fn fail(&self, reservation: &Reservation, error: &str) -> QueueResult<()>;

    /// Cancel a job that has not started. Dependents are canceled too.
    async fn cancel(&self, id: &JobId, reason: &str) -> QueueResult<Job>;

    /// Current record of a job.
    async fn fetch(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// Fail running jobs on `stages` that nobody is settling.
    ///
    /// A job is stale once it has been held longer than its `timeout_secs`
    /// plus `grace`, which only happens when the worker holding it died or
    /// lost the reservation. Stale jobs fail with a timed-out error, so their
    /// dependents are canceled. Jobs without a timeout are left alone.
    /// Returns the IDs that were failed.
    async fn recover_stale(
        &self,
        consumer: &str,
        stages: &[Stage],
        grace: Duration,
    ) -> QueueResult<Vec<JobId>>;

    /// Result of the job `job` depends on.
    ///
    /// `Ok(None)` when `job` has no dependency or the dependency recorded no
    /// result.
    async fn dependency_result(&self, job: &Job) -> QueueResult<Option<PathBuf>> {
        let Some(dep_id) = &job.depends_on else {
            return Ok(None);
        };

        let dep = self
            .fetch(dep_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(dep_id.clone()))?;

        if dep.status != JobStatus::Succeeded {
            return Err(QueueError::DependencyNotSatisfied {
                id: dep.id,
                status: dep.status,
            });
        }

        Ok(dep.result.map(PathBuf::from))
    }
}

/// What to do with a dependent job given its dependency's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    Dispatch,
    Defer,
    Cancel(String),
}

pub(crate) fn admit(dependency: &Job) -> Admission {
    match dependency.status {
        JobStatus::Succeeded => Admission::Dispatch,
        JobStatus::Failed | JobStatus::Canceled => Admission::Cancel(format!(
            "dependency {} {}",
            dependency.id, dependency.status
        )),
        JobStatus::Deferred | JobStatus::Queued | JobStatus::Running => Admission::Defer,
    }
}

/// Error recorded on a job that ran past its limit.
pub fn timed_out_message(timeout_secs: u64) -> String {
    format!("timed out after {} seconds", timeout_secs)
}

/// Whether a job held for `held` is past its limit plus `grace`.
pub(crate) fn is_overdue(job: &Job, held: Duration, grace: Duration) -> bool {
    job.timeout_secs > 0 && held >= Duration::from_secs(job.timeout_secs) + grace
}

/// Cancellation reason recorded on dependents of a failed job.
pub(crate) fn dependency_failed_reason(id: &JobId) -> String {
    format!("dependency {} failed", id)
}
