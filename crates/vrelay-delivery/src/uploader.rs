//! Credential-refreshing, retrying delivery of one artifact.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};
use vrelay_models::UploadContext;

use crate::auth::AuthClient;
use crate::client::UploadClient;
use crate::error::{DeliveryError, DeliveryResult};
use crate::metrics::record_upload;
use crate::retry::{DeliveryClassifier, RetryPolicy};

/// Delivers artifacts: token exchange plus transfer, retried as one unit.
#[derive(Debug, Clone)]
pub struct Uploader {
    auth: Arc<AuthClient>,
    client: UploadClient,
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(auth: Arc<AuthClient>, client: UploadClient, policy: RetryPolicy) -> Self {
        Self {
            auth,
            client,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upload `path` on behalf of `context`.
    ///
    /// On success the local file is deleted. When every attempt fails the
    /// file is left in place and the last error is returned.
    pub async fn deliver(&self, path: &Path, context: &UploadContext) -> DeliveryResult<Value> {
        if context.refresh_token.trim().is_empty() {
            return Err(DeliveryError::MissingCredential(format!(
                "no refresh token for user {}",
                context.user_id
            )));
        }
        if !path.exists() {
            return Err(DeliveryError::FileNotFound(path.to_path_buf()));
        }

        let start = Instant::now();
        let folder = context.folder.as_deref();

        let result = self
            .policy
            .run(&DeliveryClassifier, "upload", || async {
                // Fresh bearer per attempt; the previous one may have expired
                let session = self.auth.exchange(&context.refresh_token).await?;
                self.client.upload(path, session.bearer(), folder).await
            })
            .await;

        record_upload(result.is_ok(), start.elapsed());

        match result {
            Ok(response) => {
                info!(
                    path = %path.display(),
                    user_id = %context.user_id,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Delivered artifact"
                );
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path.display(), "Failed to delete delivered artifact: {}", e),
                }
                Ok(response)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    user_id = %context.user_id,
                    "Delivery failed, artifact kept for recovery: {}",
                    e
                );
                Err(e)
            }
        }
    }
}
