//! Upload stage: resolve the artifact, then deliver it.

use std::path::PathBuf;

use tracing::debug;
use vrelay_delivery::DeliveryError;
use vrelay_models::{Job, JobPayload};
use vrelay_queue::JobBackend;

use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// Pick the file an upload job sends.
///
/// The dependency's recorded result wins; the job's own input is the
/// fallback. Fails with `MissingInput` when neither is set and with
/// `FileNotFound` when the chosen path does not exist. Never touches the
/// network.
pub async fn resolve_input(backend: &dyn JobBackend, job: &Job) -> WorkerResult<PathBuf> {
    let explicit = match &job.payload {
        JobPayload::Upload { input, .. } => input.clone(),
        JobPayload::Compress { .. } => {
            return Err(WorkerError::job_failed(format!(
                "job {} is not an upload job",
                job.id
            )))
        }
    };

    let path = backend
        .dependency_result(job)
        .await?
        .or(explicit)
        .ok_or(DeliveryError::MissingInput)?;

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(DeliveryError::FileNotFound(path).into());
    }
    Ok(path)
}

/// Run an upload job. The job result is the delivered artifact path.
pub async fn run_upload(ctx: &WorkerContext, job: &Job) -> WorkerResult<String> {
    let context = job
        .upload_context()
        .ok_or_else(|| WorkerError::job_failed(format!("job {} has no upload context", job.id)))?;

    let path = resolve_input(ctx.backend.as_ref(), job).await?;

    let logger = JobLogger::for_job(job);
    logger.log_progress(&format!("uploading {}", path.display()));

    let uploader = ctx.uploader().await?;
    let response = uploader.deliver(&path, context).await?;
    debug!(job_id = %job.id, response = %response, "Upload response");

    Ok(path.to_string_lossy().into_owned())
}
