//! Job executor: reserves jobs from the stage queues and runs them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;
use vrelay_models::{Job, Stage};
use vrelay_queue::Reservation;

use crate::compress_job::run_compress;
use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::upload_job::run_upload;

/// Counter of finished jobs, labelled by stage and outcome.
pub const JOBS_TOTAL: &str = "vrelay_jobs_total";

/// Job executor.
pub struct JobExecutor {
    ctx: Arc<WorkerContext>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            ctx,
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until `shutdown` is called, then wait for in-flight jobs.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs on stages {:?}",
            self.consumer_name, self.ctx.config.max_concurrent_jobs, self.ctx.config.stages
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let recovery = self.spawn_recovery();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        let _ = recovery.await;

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.ctx.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                "In-flight jobs still running after {:?}",
                self.ctx.config.shutdown_timeout
            );
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Periodically fail jobs abandoned by workers that went away.
    fn spawn_recovery(&self) -> JoinHandle<()> {
        let backend = Arc::clone(&self.ctx.backend);
        let consumer = self.consumer_name.clone();
        let stages = self.ctx.config.stages.clone();
        let grace = self.ctx.config.stale_grace;
        let mut interval = tokio::time::interval(self.ctx.config.recover_interval.max(Duration::from_millis(1)));
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match backend.recover_stale(&consumer, &stages, grace).await {
                            Ok(ids) if !ids.is_empty() => {
                                info!("Failed {} abandoned jobs", ids.len());
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to recover abandoned jobs: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// Reserve as many jobs as there are free slots and spawn them.
    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let reservations = self
            .ctx
            .backend
            .reserve(
                &self.consumer_name,
                &self.ctx.config.stages,
                self.ctx.config.poll_interval,
                available.min(5),
            )
            .await?;

        if reservations.is_empty() {
            return Ok(());
        }

        debug!("Reserved {} jobs", reservations.len());

        for reservation in reservations {
            let ctx = Arc::clone(&self.ctx);
            let permit = self
                .job_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_job(ctx, reservation).await;
            });
        }

        Ok(())
    }

    /// Run one reserved job under its timeout and settle it in the queue.
    pub async fn execute_job(ctx: Arc<WorkerContext>, reservation: Reservation) {
        let job = &reservation.job;
        let logger = JobLogger::for_job(job);
        let span = logger.create_span();

        async {
            logger.log_start(&format!("attempt on {}", job.stage));
            let start = Instant::now();

            let result = match tokio::time::timeout(job_limit(job), Self::process_job(&ctx, job)).await {
                Ok(result) => result,
                Err(_) => Err(WorkerError::TimedOut(job.timeout_secs)),
            };

            let outcome = match result {
                Ok(artifact) => {
                    logger.log_completion(&format!(
                        "{} in {:.1}s",
                        artifact,
                        start.elapsed().as_secs_f64()
                    ));
                    if let Err(e) = ctx.backend.complete(&reservation, &artifact).await {
                        error!(job_id = %job.id, "Failed to record job success: {}", e);
                    }
                    "succeeded"
                }
                Err(e) => {
                    let message = e.to_string();
                    logger.log_error(&message);
                    if let Err(qe) = ctx.backend.fail(&reservation, &message).await {
                        error!(job_id = %job.id, "Failed to record job failure: {}", qe);
                    }
                    "failed"
                }
            };

            metrics::counter!(
                JOBS_TOTAL,
                "stage" => job.stage.as_str(),
                "outcome" => outcome
            )
            .increment(1);
        }
        .instrument(span)
        .await
    }

    async fn process_job(ctx: &WorkerContext, job: &Job) -> WorkerResult<String> {
        match job.stage {
            Stage::Compress => run_compress(ctx, job).await,
            Stage::Upload => run_upload(ctx, job).await,
        }
    }

    /// Wait for all in-flight jobs to complete.
    async fn wait_for_jobs(&self) {
        loop {
            let available = self.job_semaphore.available_permits();
            if available == self.ctx.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Runtime limit for a job. Zero means unbounded.
fn job_limit(job: &Job) -> Duration {
    match job.timeout_secs {
        0 => Duration::MAX,
        secs => Duration::from_secs(secs),
    }
}
