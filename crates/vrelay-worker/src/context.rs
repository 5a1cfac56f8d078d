//! Shared state handed to every job a worker runs.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;
use vrelay_delivery::{AuthClient, AuthConfig, UploadClient, UploadConfig, Uploader};
use vrelay_media::MediaToolkit;
use vrelay_queue::JobBackend;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};

/// Settings for the delivery clients, resolved when the worker starts.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub auth: AuthConfig,
    pub upload: UploadConfig,
}

impl DeliverySettings {
    pub fn new(auth: AuthConfig, upload: UploadConfig) -> Self {
        Self { auth, upload }
    }

    /// Create from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        Ok(Self {
            auth: AuthConfig::from_env()?,
            upload: UploadConfig::from_env()?,
        })
    }
}

/// Per-process worker context.
///
/// The uploader is built on first use and then shared by every upload job
/// this process runs.
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub backend: Arc<dyn JobBackend>,
    pub toolkit: Arc<dyn MediaToolkit>,
    delivery: DeliverySettings,
    uploader: OnceCell<Uploader>,
}

impl WorkerContext {
    pub fn new(
        config: WorkerConfig,
        backend: Arc<dyn JobBackend>,
        toolkit: Arc<dyn MediaToolkit>,
        delivery: DeliverySettings,
    ) -> Self {
        Self {
            config,
            backend,
            toolkit,
            delivery,
            uploader: OnceCell::new(),
        }
    }

    /// Uploader for this process, constructing it on the first call.
    ///
    /// Concurrent first calls build it once; later calls return the same
    /// instance. Construction makes no network requests.
    pub async fn uploader(&self) -> WorkerResult<&Uploader> {
        self.uploader
            .get_or_try_init(|| async {
                let auth = AuthClient::new(self.delivery.auth.clone())?;
                let client = UploadClient::new(self.delivery.upload.clone())?;
                let policy = self.delivery.upload.retry.clone();
                info!(
                    upload_url = %self.delivery.upload.base_url,
                    max_retries = policy.max_retries,
                    "Initialized delivery clients"
                );
                Ok::<_, WorkerError>(Uploader::new(Arc::new(auth), client, policy))
            })
            .await
    }

    /// Whether the uploader has been constructed.
    pub fn uploader_ready(&self) -> bool {
        self.uploader.initialized()
    }
}
