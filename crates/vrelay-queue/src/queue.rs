//! Job queue using Redis Streams.
//!
//! Layout, with the default `vrelay` prefix:
//! - `vrelay:stage:<stage>`: one stream per stage, entries carry a job ID
//! - `vrelay:job:<id>`: JSON job record (status, result, error)
//! - `vrelay:deferred:<id>`: set of jobs waiting on `<id>`
//! - `vrelay:failed`: failure record stream
//!
//! A deferred job is dispatched by whoever removes it from its dependency's
//! set, so a submit racing with the dependency's completion dispatches once.
//!
//! Entries stay pending in the consumer group until the job settles. A
//! pending entry idle past its job's limit belongs to a worker that died and
//! is reclaimed by `recover_stale`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use vrelay_models::{Job, JobId, JobStatus, Stage};

use crate::backend::{
    admit, dependency_failed_reason, is_overdue, timed_out_message, Admission, FailureRecord,
    JobBackend, Reservation,
};
use crate::error::{QueueError, QueueResult};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix
    pub prefix: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Lifetime of job records and dependents sets
    pub record_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "vrelay".to_string(),
            consumer_group: "vrelay:workers".to_string(),
            record_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            prefix: std::env::var("QUEUE_PREFIX").unwrap_or(defaults.prefix),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            record_ttl: std::env::var("QUEUE_RECORD_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.record_ttl),
        }
    }

    pub fn stage_stream(&self, stage: Stage) -> String {
        format!("{}:stage:{}", self.prefix, stage)
    }

    pub fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    pub fn deferred_key(&self, id: &JobId) -> String {
        format!("{}:deferred:{}", self.prefix, id)
    }

    pub fn failed_stream(&self) -> String {
        format!("{}:failed", self.prefix)
    }
}

/// Pending entries inspected per stage on each recovery pass.
const RECOVER_BATCH: usize = 100;

/// Redis-backed [`JobBackend`].
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Create the consumer group on every stage stream if missing.
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        for stage in Stage::ALL {
            let stream = self.config.stage_stream(stage);
            // Start at 0 so jobs submitted before the first worker are not skipped
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(&self.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(()) => info!("Created consumer group {} on {}", self.config.consumer_group, stream),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!("Consumer group already exists on {}", stream);
                }
                Err(e) => return Err(QueueError::Redis(e)),
            }
        }

        Ok(())
    }

    /// Number of entries in a stage stream.
    pub async fn len(&self, stage: Stage) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.xlen(self.config.stage_stream(stage)).await?;
        Ok(len)
    }

    /// Number of failure records.
    pub async fn failed_len(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.xlen(self.config.failed_stream()).await?;
        Ok(len)
    }

    async fn load(&self, conn: &mut MultiplexedConnection, id: &JobId) -> QueueResult<Option<Job>> {
        let raw: Option<String> = conn.get(self.config.job_key(id)).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(QueueError::from))
            .transpose()
    }

    async fn load_required(&self, conn: &mut MultiplexedConnection, id: &JobId) -> QueueResult<Job> {
        self.load(conn, id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))
    }

    async fn save(&self, conn: &mut MultiplexedConnection, job: &Job) -> QueueResult<()> {
        let payload = serde_json::to_string(job)?;
        conn.set_ex::<_, _, ()>(self.config.job_key(&job.id), payload, self.config.record_ttl.as_secs())
            .await?;
        Ok(())
    }

    /// Mark queued, persist, and append to the stage stream.
    async fn dispatch(&self, conn: &mut MultiplexedConnection, job: &mut Job) -> QueueResult<()> {
        job.status = JobStatus::Queued;
        self.save(conn, job).await?;

        let message_id: String = redis::cmd("XADD")
            .arg(self.config.stage_stream(job.stage))
            .arg("*")
            .arg("job_id")
            .arg(job.id.as_str())
            .query_async(conn)
            .await?;

        debug!(job_id = %job.id, stage = %job.stage, message_id = %message_id, "Dispatched job");
        Ok(())
    }

    /// Claim `child` from `parent`'s dependents set. Only one caller wins.
    async fn claim(&self, conn: &mut MultiplexedConnection, parent: &JobId, child: &JobId) -> QueueResult<bool> {
        let removed: i64 = conn.srem(self.config.deferred_key(parent), child.as_str()).await?;
        Ok(removed == 1)
    }

    async fn release_dependents(&self, conn: &mut MultiplexedConnection, parent: &JobId) -> QueueResult<()> {
        let children: Vec<String> = conn.smembers(self.config.deferred_key(parent)).await?;
        for child in children.into_iter().map(JobId::from_string) {
            if !self.claim(conn, parent, &child).await? {
                continue;
            }
            match self.load(conn, &child).await? {
                Some(mut job) if job.status == JobStatus::Deferred => {
                    self.dispatch(conn, &mut job).await?;
                    debug!(job_id = %child, dependency = %parent, "Released dependent job");
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Cancel every job deferred on `root`, transitively.
    async fn cancel_dependents(&self, conn: &mut MultiplexedConnection, root: &JobId, reason: &str) -> QueueResult<()> {
        let mut pending = vec![root.clone()];
        while let Some(parent) = pending.pop() {
            let children: Vec<String> = conn.smembers(self.config.deferred_key(&parent)).await?;
            for child in children.into_iter().map(JobId::from_string) {
                if !self.claim(conn, &parent, &child).await? {
                    continue;
                }
                if let Some(mut job) = self.load(conn, &child).await? {
                    if job.status.is_pending() {
                        job.cancel(reason);
                        self.save(conn, &job).await?;
                        debug!(job_id = %child, "Canceled dependent job: {}", reason);
                        pending.push(child);
                    }
                }
            }
        }
        Ok(())
    }

    async fn ack(&self, conn: &mut MultiplexedConnection, stage: Stage, message_id: &str) -> QueueResult<()> {
        let stream = self.config.stage_stream(stage);

        redis::cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&stream)
            .arg(message_id)
            .query_async::<()>(conn)
            .await?;

        Ok(())
    }

    /// Job ID carried by a stream entry, `None` once the entry is gone.
    async fn entry_job_id(&self, conn: &mut MultiplexedConnection, stream: &str, message_id: &str) -> QueueResult<Option<JobId>> {
        let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg(message_id)
            .arg(message_id)
            .query_async(conn)
            .await?;

        Ok(reply.ids.into_iter().next().and_then(|entry| match entry.map.get("job_id") {
            Some(redis::Value::BulkString(raw)) => {
                Some(JobId::from_string(String::from_utf8_lossy(raw).into_owned()))
            }
            _ => None,
        }))
    }

    /// Take over a pending entry. Only one caller wins while it stays idle
    /// for at least `min_idle`.
    async fn take_over(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
        consumer: &str,
        min_idle: Duration,
        message_id: &str,
    ) -> QueueResult<bool> {
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(message_id)
            .arg("JUSTID")
            .query_async(conn)
            .await?;
        Ok(claimed.iter().any(|id| id == message_id))
    }

    async fn running(&self, conn: &mut MultiplexedConnection, reservation: &Reservation) -> QueueResult<Job> {
        let job = self.load_required(conn, &reservation.job.id).await?;
        if job.status != JobStatus::Running {
            return Err(QueueError::InvalidState {
                id: job.id,
                status: job.status,
                action: "settle",
            });
        }
        Ok(job)
    }
}

#[async_trait]
impl JobBackend for JobQueue {
    async fn submit(&self, mut job: Job) -> QueueResult<Job> {
        let mut conn = self.conn().await?;

        let Some(dep_id) = job.depends_on.clone() else {
            self.dispatch(&mut conn, &mut job).await?;
            info!(job_id = %job.id, stage = %job.stage, "Submitted job");
            return Ok(job);
        };

        let dep = self.load_required(&mut conn, &dep_id).await?;
        match admit(&dep) {
            Admission::Dispatch => self.dispatch(&mut conn, &mut job).await?,
            Admission::Cancel(reason) => {
                job.cancel(reason);
                self.save(&mut conn, &job).await?;
            }
            Admission::Defer => {
                job.status = JobStatus::Deferred;
                self.save(&mut conn, &job).await?;
                let deferred_key = self.config.deferred_key(&dep_id);
                conn.sadd::<_, _, ()>(&deferred_key, job.id.as_str()).await?;
                conn.expire::<_, ()>(&deferred_key, self.config.record_ttl.as_secs() as i64)
                    .await?;

                // The dependency may have settled between the load and the SADD
                let dep = self.load_required(&mut conn, &dep_id).await?;
                let admission = admit(&dep);
                if admission != Admission::Defer && self.claim(&mut conn, &dep_id, &job.id).await? {
                    match admission {
                        Admission::Dispatch => self.dispatch(&mut conn, &mut job).await?,
                        Admission::Cancel(reason) => {
                            job.cancel(reason);
                            self.save(&mut conn, &job).await?;
                        }
                        Admission::Defer => {}
                    }
                } else if let Some(current) = self.load(&mut conn, &job.id).await? {
                    job = current;
                }
            }
        }

        info!(job_id = %job.id, stage = %job.stage, status = %job.status, "Submitted job");
        Ok(job)
    }

    async fn reserve(
        &self,
        consumer: &str,
        stages: &[Stage],
        block: Duration,
        count: usize,
    ) -> QueueResult<Vec<Reservation>> {
        if stages.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1))
            .arg("BLOCK")
            // BLOCK 0 would wait forever
            .arg((block.as_millis() as u64).max(1))
            .arg("STREAMS");
        for stage in stages {
            cmd.arg(self.config.stage_stream(*stage));
        }
        for _ in stages {
            cmd.arg(">");
        }

        let reply: Option<redis::streams::StreamReadReply> = cmd.query_async(&mut conn).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut reserved = Vec::new();
        for stream_key in reply.keys {
            let Some(stage) = stages
                .iter()
                .copied()
                .find(|s| self.config.stage_stream(*s) == stream_key.key)
            else {
                continue;
            };

            for entry in stream_key.ids {
                let job_id = match entry.map.get("job_id") {
                    Some(redis::Value::BulkString(raw)) => {
                        JobId::from_string(String::from_utf8_lossy(raw).into_owned())
                    }
                    _ => {
                        warn!(message_id = %entry.id, "Stream entry without job_id, dropping");
                        self.ack(&mut conn, stage, &entry.id).await?;
                        continue;
                    }
                };

                let job = match self.load(&mut conn, &job_id).await {
                    Ok(Some(job)) if job.status == JobStatus::Queued => job,
                    Ok(Some(job)) => {
                        debug!(job_id = %job_id, status = %job.status, "Dropping stale delivery");
                        self.ack(&mut conn, stage, &entry.id).await?;
                        continue;
                    }
                    Ok(None) => {
                        warn!(job_id = %job_id, "Job record missing, dropping delivery");
                        self.ack(&mut conn, stage, &entry.id).await?;
                        continue;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, "Unreadable job record, dropping delivery: {}", e);
                        self.ack(&mut conn, stage, &entry.id).await?;
                        continue;
                    }
                };

                let mut job = job;
                job.start();
                self.save(&mut conn, &job).await?;
                debug!(job_id = %job.id, consumer = %consumer, "Reserved job");
                reserved.push(Reservation {
                    delivery_id: entry.id,
                    job,
                });
            }
        }

        Ok(reserved)
    }

    async fn complete(&self, reservation: &Reservation, result: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut job = self.running(&mut conn, reservation).await?;

        job.succeed(result);
        self.save(&mut conn, &job).await?;
        self.ack(&mut conn, job.stage, &reservation.delivery_id).await?;
        self.release_dependents(&mut conn, &job.id).await?;

        info!(job_id = %job.id, stage = %job.stage, "Job succeeded");
        Ok(())
    }

    async fn fail(&self, reservation: &Reservation, error: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut job = self.running(&mut conn, reservation).await?;

        job.fail(error);
        self.save(&mut conn, &job).await?;

        let record = FailureRecord::new(&job, error);
        redis::cmd("XADD")
            .arg(self.config.failed_stream())
            .arg("*")
            .arg("job_id")
            .arg(record.job_id.as_str())
            .arg("record")
            .arg(serde_json::to_string(&record)?)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(&mut conn, job.stage, &reservation.delivery_id).await?;
        self.cancel_dependents(&mut conn, &job.id, &dependency_failed_reason(&job.id))
            .await?;

        warn!(job_id = %job.id, stage = %job.stage, "Job failed: {}", error);
        Ok(())
    }

    async fn cancel(&self, id: &JobId, reason: &str) -> QueueResult<Job> {
        let mut conn = self.conn().await?;
        let mut job = self.load_required(&mut conn, id).await?;

        if !job.status.is_pending() {
            return Err(QueueError::InvalidState {
                id: id.clone(),
                status: job.status,
                action: "cancel",
            });
        }

        job.cancel(reason);
        self.save(&mut conn, &job).await?;
        if let Some(dep_id) = &job.depends_on {
            self.claim(&mut conn, dep_id, id).await?;
        }
        self.cancel_dependents(&mut conn, id, &format!("dependency {} canceled", id))
            .await?;

        info!(job_id = %id, "Canceled job: {}", reason);
        Ok(job)
    }

    async fn fetch(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, id).await
    }

    async fn recover_stale(
        &self,
        consumer: &str,
        stages: &[Stage],
        grace: Duration,
    ) -> QueueResult<Vec<JobId>> {
        let mut conn = self.conn().await?;
        let mut recovered = Vec::new();

        for stage in stages {
            let stream = self.config.stage_stream(*stage);
            let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(&stream)
                .arg(&self.config.consumer_group)
                .arg("-")
                .arg("+")
                .arg(RECOVER_BATCH)
                .query_async(&mut conn)
                .await?;

            for entry in pending.ids {
                let idle = Duration::from_millis(entry.last_delivered_ms as u64);
                if idle < grace {
                    continue;
                }

                let job = match self.entry_job_id(&mut conn, &stream, &entry.id).await? {
                    Some(id) => self.load(&mut conn, &id).await?,
                    None => None,
                };

                match job {
                    Some(job) if job.status == JobStatus::Running => {
                        if !is_overdue(&job, idle, grace) {
                            continue;
                        }
                        if !self.take_over(&mut conn, &stream, consumer, idle, &entry.id).await? {
                            continue;
                        }
                        info!(
                            job_id = %job.id,
                            previous_consumer = %entry.consumer,
                            idle_secs = idle.as_secs(),
                            "Reclaimed abandoned job"
                        );
                        let reservation = Reservation {
                            delivery_id: entry.id,
                            job,
                        };
                        let message = timed_out_message(reservation.job.timeout_secs);
                        match self.fail(&reservation, &message).await {
                            Ok(()) => recovered.push(reservation.job.id),
                            Err(QueueError::InvalidState { .. }) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    // Delivered but never marked running: hand it out again
                    Some(mut job) if job.status == JobStatus::Queued => {
                        if self.take_over(&mut conn, &stream, consumer, idle, &entry.id).await? {
                            self.ack(&mut conn, *stage, &entry.id).await?;
                            self.dispatch(&mut conn, &mut job).await?;
                            info!(job_id = %job.id, "Requeued undelivered job");
                        }
                    }
                    _ => {
                        if self.take_over(&mut conn, &stream, consumer, idle, &entry.id).await? {
                            debug!(message_id = %entry.id, "Dropping settled pending entry");
                            self.ack(&mut conn, *stage, &entry.id).await?;
                        }
                    }
                }
            }
        }

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Failed abandoned jobs");
        }
        Ok(recovered)
    }
}
