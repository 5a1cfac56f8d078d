//! In-process queue backend.
//!
//! Same semantics as the Redis backend without durability. Used by tests and
//! single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vrelay_models::{Job, JobId, JobStatus, Stage};

use crate::backend::{
    admit, dependency_failed_reason, is_overdue, timed_out_message, Admission, FailureRecord,
    JobBackend, Reservation,
};
use crate::error::{QueueError, QueueResult};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    queues: HashMap<Stage, VecDeque<(String, JobId)>>,
    /// Dependency ID -> jobs deferred on it
    deferred: HashMap<JobId, Vec<JobId>>,
    failures: Vec<FailureRecord>,
    next_delivery: u64,
}

impl State {
    fn dispatch(&mut self, id: &JobId) {
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        job.status = JobStatus::Queued;
        let stage = job.stage;

        self.next_delivery += 1;
        let delivery_id = format!("{}-{}", stage, self.next_delivery);
        self.queues
            .entry(stage)
            .or_default()
            .push_back((delivery_id, id.clone()));
    }

    /// Cancel `root`'s deferred dependents, transitively.
    fn cancel_dependents(&mut self, root: &JobId, reason: &str) {
        let mut pending = vec![root.clone()];
        while let Some(parent) = pending.pop() {
            for child in self.deferred.remove(&parent).unwrap_or_default() {
                if let Some(job) = self.jobs.get_mut(&child) {
                    if job.status.is_pending() {
                        job.cancel(reason);
                        debug!(job_id = %child, "Canceled dependent job: {}", reason);
                        pending.push(child);
                    }
                }
            }
        }
    }

    fn running(&mut self, reservation: &Reservation) -> QueueResult<&mut Job> {
        let id = &reservation.job.id;
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;
        if job.status != JobStatus::Running {
            return Err(QueueError::InvalidState {
                id: id.clone(),
                status: job.status,
                action: "settle",
            });
        }
        Ok(job)
    }
}

/// In-memory [`JobBackend`].
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Failure records, oldest first.
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.state().failures.clone()
    }

    /// Number of queued deliveries on `stage`.
    pub fn queued(&self, stage: Stage) -> usize {
        self.state().queues.get(&stage).map_or(0, VecDeque::len)
    }

    fn take(&self, stages: &[Stage], count: usize) -> Vec<Reservation> {
        let mut state = self.state();
        let mut reserved = Vec::new();

        for stage in stages {
            while reserved.len() < count {
                let Some((delivery_id, id)) =
                    state.queues.get_mut(stage).and_then(VecDeque::pop_front)
                else {
                    break;
                };
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                if job.status != JobStatus::Queued {
                    debug!(job_id = %id, status = %job.status, "Dropping stale delivery");
                    continue;
                }
                job.start();
                reserved.push(Reservation {
                    delivery_id,
                    job: job.clone(),
                });
            }
        }

        reserved
    }
}

#[async_trait]
impl JobBackend for MemoryQueue {
    async fn submit(&self, mut job: Job) -> QueueResult<Job> {
        let stored = {
            let mut state = self.state();

            let admission = match &job.depends_on {
                None => Admission::Dispatch,
                Some(dep_id) => {
                    let dep = state
                        .jobs
                        .get(dep_id)
                        .ok_or_else(|| QueueError::JobNotFound(dep_id.clone()))?;
                    admit(dep)
                }
            };

            let id = job.id.clone();
            match admission {
                Admission::Dispatch => {
                    state.jobs.insert(id.clone(), job);
                    state.dispatch(&id);
                }
                Admission::Defer => {
                    job.status = JobStatus::Deferred;
                    if let Some(dep_id) = &job.depends_on {
                        state.deferred.entry(dep_id.clone()).or_default().push(id.clone());
                    }
                    state.jobs.insert(id.clone(), job);
                }
                Admission::Cancel(reason) => {
                    job.cancel(reason);
                    state.jobs.insert(id.clone(), job);
                }
            }
            state.jobs.get(&id).cloned().ok_or(QueueError::JobNotFound(id))?
        };

        info!(job_id = %stored.id, stage = %stored.stage, status = %stored.status, "Submitted job");
        self.notify.notify_waiters();
        Ok(stored)
    }

    async fn reserve(
        &self,
        _consumer: &str,
        stages: &[Stage],
        block: Duration,
        count: usize,
    ) -> QueueResult<Vec<Reservation>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so a concurrent submit is not missed
            let notified = self.notify.notified();

            let reserved = self.take(stages, count.max(1));
            if !reserved.is_empty() {
                return Ok(reserved);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn complete(&self, reservation: &Reservation, result: &str) -> QueueResult<()> {
        {
            let mut state = self.state();
            state.running(reservation)?.succeed(result);

            let id = &reservation.job.id;
            for child in state.deferred.remove(id).unwrap_or_default() {
                let deferred = state
                    .jobs
                    .get(&child)
                    .is_some_and(|job| job.status == JobStatus::Deferred);
                if deferred {
                    state.dispatch(&child);
                    debug!(job_id = %child, dependency = %id, "Released dependent job");
                }
            }
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn fail(&self, reservation: &Reservation, error: &str) -> QueueResult<()> {
        let mut state = self.state();
        let job = state.running(reservation)?;
        job.fail(error);
        let record = FailureRecord::new(job, error);

        warn!(job_id = %record.job_id, stage = %record.stage, "Job failed: {}", error);
        state.failures.push(record);
        state.cancel_dependents(&reservation.job.id, &dependency_failed_reason(&reservation.job.id));
        Ok(())
    }

    async fn cancel(&self, id: &JobId, reason: &str) -> QueueResult<Job> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;

        if !job.status.is_pending() {
            return Err(QueueError::InvalidState {
                id: id.clone(),
                status: job.status,
                action: "cancel",
            });
        }
        job.cancel(reason);
        let canceled = job.clone();

        if let Some(dep_id) = &canceled.depends_on {
            if let Some(siblings) = state.deferred.get_mut(dep_id) {
                siblings.retain(|s| s != id);
            }
        }
        state.cancel_dependents(id, &format!("dependency {} canceled", id));

        info!(job_id = %id, "Canceled job: {}", reason);
        Ok(canceled)
    }

    async fn fetch(&self, id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.state().jobs.get(id).cloned())
    }

    async fn recover_stale(
        &self,
        _consumer: &str,
        stages: &[Stage],
        grace: Duration,
    ) -> QueueResult<Vec<JobId>> {
        let now = chrono::Utc::now();
        let stale: Vec<Job> = self
            .state()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running && stages.contains(&job.stage))
            .filter(|job| {
                let held = job
                    .started_at
                    .and_then(|started| (now - started).to_std().ok())
                    .unwrap_or_default();
                is_overdue(job, held, grace)
            })
            .cloned()
            .collect();

        let mut recovered = Vec::new();
        for job in stale {
            let reservation = Reservation {
                delivery_id: String::new(),
                job,
            };
            match self
                .fail(&reservation, &timed_out_message(reservation.job.timeout_secs))
                .await
            {
                Ok(()) => recovered.push(reservation.job.id),
                // Settled since the scan
                Err(QueueError::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }
}
