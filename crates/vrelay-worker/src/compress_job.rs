//! Compress stage: normalize audio, then transcode unless already HEVC.

use vrelay_media::compress_video;
use vrelay_models::{Job, JobPayload};

use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// Run a compress job and return the artifact path to record as its result.
pub async fn run_compress(ctx: &WorkerContext, job: &Job) -> WorkerResult<String> {
    let JobPayload::Compress { input } = &job.payload else {
        return Err(WorkerError::job_failed(format!(
            "job {} is not a compress job",
            job.id
        )));
    };

    let logger = JobLogger::for_job(job);
    logger.log_progress(&format!("compressing {}", input.display()));

    let settings = ctx.config.compress_settings();
    let output = compress_video(ctx.toolkit.as_ref(), input, &settings).await?;

    Ok(output.to_string_lossy().into_owned())
}
