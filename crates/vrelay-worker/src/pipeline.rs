//! Enqueue side of the compress-then-upload pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use vrelay_models::{Job, JobId, UploadContext};
use vrelay_queue::JobBackend;

use crate::config::WorkerConfig;
use crate::error::WorkerResult;

/// A staged file to be processed and delivered.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub staged_path: PathBuf,
    pub context: UploadContext,
    /// Compress before uploading. When false the staged file is uploaded as is.
    pub compress: bool,
}

impl SubmitRequest {
    pub fn new(staged_path: impl Into<PathBuf>, context: UploadContext) -> Self {
        Self {
            staged_path: staged_path.into(),
            context,
            compress: true,
        }
    }

    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }
}

/// IDs of the jobs created for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedPipeline {
    pub compress: Option<JobId>,
    pub upload: JobId,
}

/// Creates linked compress and upload jobs.
#[derive(Clone)]
pub struct Pipeline {
    backend: Arc<dyn JobBackend>,
    compress_timeout: Duration,
    upload_timeout: Duration,
}

impl Pipeline {
    pub fn new(backend: Arc<dyn JobBackend>, compress_timeout: Duration, upload_timeout: Duration) -> Self {
        Self {
            backend,
            compress_timeout,
            upload_timeout,
        }
    }

    /// Pipeline using the job timeouts from `config`.
    pub fn from_config(backend: Arc<dyn JobBackend>, config: &WorkerConfig) -> Self {
        Self::new(backend, config.compress_timeout, config.upload_timeout)
    }

    /// Validate the context and enqueue the jobs for `request`.
    ///
    /// The upload job depends on the compress job and reads the compressed
    /// artifact path from its result. Nothing is enqueued when the context
    /// is invalid.
    pub async fn submit(&self, request: SubmitRequest) -> WorkerResult<SubmittedPipeline> {
        let context = request.context.validated()?;

        if !request.compress {
            let upload = self
                .backend
                .submit(Job::upload_file(
                    request.staged_path,
                    context,
                    self.upload_timeout.as_secs(),
                ))
                .await?;
            info!(upload_job = %upload.id, "Submitted upload-only pipeline");
            return Ok(SubmittedPipeline {
                compress: None,
                upload: upload.id,
            });
        }

        let compress = self
            .backend
            .submit(Job::compress(
                request.staged_path,
                self.compress_timeout.as_secs(),
            ))
            .await?;

        let upload = self
            .backend
            .submit(Job::upload_after(
                compress.id.clone(),
                context,
                self.upload_timeout.as_secs(),
            ))
            .await?;

        info!(
            compress_job = %compress.id,
            upload_job = %upload.id,
            "Submitted compress and upload pipeline"
        );

        Ok(SubmittedPipeline {
            compress: Some(compress.id),
            upload: upload.id,
        })
    }
}
