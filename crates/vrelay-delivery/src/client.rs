//! Streaming multipart upload client.

use std::path::Path;
use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde_json::Value;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, DeliveryResult};
use crate::progress::DecileReporter;
use crate::retry::RetryPolicy;

/// Upload path on the storage server.
pub const UPLOAD_PATH: &str = "/api/upload";

/// Configuration for the upload client.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Base URL of the storage server
    pub base_url: String,
    /// Per-request timeout, covering the whole transfer
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Retry policy wrapped around token exchange plus transfer
    pub retry: RetryPolicy,
}

impl UploadConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(30),
            retry: RetryPolicy::upload(),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> DeliveryResult<Self> {
        let base_url = std::env::var("UPLOAD_SERVER_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| DeliveryError::Config("UPLOAD_SERVER_URL is not set".to_string()))?;

        let defaults = RetryPolicy::upload();
        let retry = RetryPolicy {
            max_retries: env_parse("UPLOAD_MAX_RETRIES").unwrap_or(defaults.max_retries),
            base_delay: env_parse("UPLOAD_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: env_parse("UPLOAD_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            ..defaults
        };

        Ok(Self {
            timeout: Duration::from_secs(env_parse("UPLOAD_TIMEOUT_SECS").unwrap_or(3600)),
            retry,
            ..Self::new(base_url.trim_end_matches('/'))
        })
    }

    fn upload_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), UPLOAD_PATH)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Client for the storage server's upload endpoint.
#[derive(Debug, Clone)]
pub struct UploadClient {
    http: Client,
    config: UploadConfig,
}

impl UploadClient {
    pub fn new(config: UploadConfig) -> DeliveryResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(DeliveryError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> DeliveryResult<Self> {
        Self::new(UploadConfig::from_env()?)
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Stream `path` to the upload endpoint as multipart field `file`.
    ///
    /// The file is read in chunks, never buffered whole. A non-JSON
    /// success body is returned as a JSON string.
    pub async fn upload(&self, path: &Path, bearer: &str, folder: Option<&str>) -> DeliveryResult<Value> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DeliveryError::FileNotFound(path.to_path_buf())
            } else {
                DeliveryError::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.mp4".to_string());

        let mut reporter = DecileReporter::new(file_name.clone(), size);
        let stream = ReaderStream::new(file).inspect_ok(move |chunk| {
            reporter.advance(chunk.len() as u64);
        });

        let part = Part::stream_with_length(Body::wrap_stream(stream), size)
            .file_name(file_name.clone())
            .mime_str("video/mp4")?;

        let mut form = Form::new().part("file", part);
        if let Some(folder) = folder {
            form = form.text("folder", folder.to_string());
        }

        let url = self.config.upload_url();
        debug!(url = %url, file = %file_name, size_bytes = size, "Starting upload");

        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DeliveryError::from_status(status.as_u16(), body));
        }

        info!(file = %file_name, status = status.as_u16(), "Upload accepted");
        match serde_json::from_str(&body) {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!(file = %file_name, "Upload response is not JSON, keeping raw body");
                Ok(Value::String(body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> UploadClient {
        UploadClient::new(UploadConfig::new(server.uri())).unwrap()
    }

    fn artifact(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, "fake video bytes").unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_streams_file_with_bearer_and_folder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_string_contains("name=\"file\"; filename=\"clip.mp4\""))
            .and(body_string_contains("fake video bytes"))
            .and(body_string_contains("name=\"folder\""))
            .and(body_string_contains("Trips/2024"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"path": "Trips/2024/clip.mp4"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let response = client(&server)
            .upload(&artifact(&dir), "token-1", Some("Trips/2024"))
            .await
            .unwrap();

        assert_eq!(response["path"], "Trips/2024/clip.mp4");
    }

    #[tokio::test]
    async fn test_upload_without_folder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let response = client(&server)
            .upload(&artifact(&dir), "t", None)
            .await
            .unwrap();
        assert_eq!(response, Value::String("ok".into()));

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(!body.contains("name=\"folder\""));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_retryable_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = client(&server)
            .upload(&artifact(&dir), "t", None)
            .await
            .unwrap_err();

        assert_eq!(err.http_status(), Some(503));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let server = MockServer::start().await;
        let err = client(&server)
            .upload(Path::new("/nonexistent/clip.mp4"), "t", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::FileNotFound(_)));
    }

    #[test]
    fn test_upload_url_joins_base() {
        assert_eq!(
            UploadConfig::new("http://nas.local:3000/").upload_url(),
            "http://nas.local:3000/api/upload"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::remove_var("UPLOAD_SERVER_URL");
        assert!(UploadConfig::from_env().is_err());

        std::env::set_var("UPLOAD_SERVER_URL", "http://nas.local:3000");
        std::env::set_var("UPLOAD_MAX_RETRIES", "7");
        std::env::set_var("UPLOAD_RETRY_BASE_MS", "250");
        let config = UploadConfig::from_env().unwrap();

        assert_eq!(config.base_url, "http://nas.local:3000");
        assert_eq!(config.timeout, Duration::from_secs(3600));
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_secs(30));

        std::env::remove_var("UPLOAD_SERVER_URL");
        std::env::remove_var("UPLOAD_MAX_RETRIES");
        std::env::remove_var("UPLOAD_RETRY_BASE_MS");
    }
}
