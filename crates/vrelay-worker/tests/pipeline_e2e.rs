//! Full pipeline runs against an in-memory queue, a fake ffmpeg and a mock
//! storage server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vrelay_delivery::{AuthConfig, RetryPolicy, UploadConfig};
use vrelay_media::{FfmpegCommand, MediaResult, MediaToolkit, ProbeStream};
use vrelay_models::{Job, JobId, JobStatus, UploadContext};
use vrelay_queue::{JobBackend, MemoryQueue};
use vrelay_worker::{
    DeliverySettings, JobExecutor, Pipeline, SubmitRequest, WorkerConfig, WorkerContext,
};

const HEVC_MAGIC: &[u8] = b"HEVC:";

/// Fake ffmpeg with one audio stream: normalization is skipped and encodes
/// prepend `HEVC_MAGIC` to the source bytes. A slow encode leaves a partial
/// output on disk while it runs.
#[derive(Default)]
struct FakeToolkit {
    encode_delay: Option<Duration>,
}

#[async_trait]
impl MediaToolkit for FakeToolkit {
    async fn probe_streams(&self, path: &Path, selector: &str) -> MediaResult<Vec<ProbeStream>> {
        let bytes = tokio::fs::read(path).await?;
        let stream = if selector.starts_with('v') {
            let codec = if bytes.starts_with(HEVC_MAGIC) { "hevc" } else { "h264" };
            ProbeStream {
                index: 0,
                codec_type: Some("video".into()),
                codec_name: Some(codec.into()),
                ..Default::default()
            }
        } else {
            ProbeStream {
                index: 1,
                codec_type: Some("audio".into()),
                codec_name: Some("aac".into()),
                ..Default::default()
            }
        };
        Ok(vec![stream])
    }

    async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        if let Some(delay) = self.encode_delay {
            tokio::fs::write(cmd.output(), b"partial").await?;
            tokio::time::sleep(delay).await;
        }
        let mut bytes = HEVC_MAGIC.to_vec();
        bytes.extend(tokio::fs::read(cmd.input()).await?);
        tokio::fs::write(cmd.output(), bytes).await?;
        Ok(())
    }

    async fn run_captured(&self, cmd: &FfmpegCommand) -> MediaResult<String> {
        self.run(cmd).await?;
        Ok(String::new())
    }
}

struct Harness {
    dir: TempDir,
    queue: Arc<MemoryQueue>,
    pipeline: Pipeline,
    executor: Arc<JobExecutor>,
}

impl Harness {
    fn new(server: &MockServer, toolkit: FakeToolkit, compress_timeout: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("staging")).unwrap();

        let config = WorkerConfig {
            compressed_dir: Some(dir.path().join("compressed")),
            compress_timeout,
            poll_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        };

        let mut upload = UploadConfig::new(server.uri());
        upload.retry = RetryPolicy::upload()
            .with_max_retries(5)
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50));
        let delivery = DeliverySettings::new(
            AuthConfig::new("test-key").with_token_endpoint(format!("{}/v1/token", server.uri())),
            upload,
        );

        let queue = Arc::new(MemoryQueue::new());
        let pipeline = Pipeline::from_config(queue.clone(), &config);
        let ctx = Arc::new(WorkerContext::new(
            config,
            queue.clone(),
            Arc::new(toolkit),
            delivery,
        ));

        Self {
            dir,
            queue,
            pipeline,
            executor: Arc::new(JobExecutor::new(ctx)),
        }
    }

    fn stage_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join("staging").join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Run the executor until `id` reaches a terminal state.
    async fn run_until_settled(&self, id: &JobId) -> Job {
        let executor = Arc::clone(&self.executor);
        let handle = tokio::spawn(async move { executor.run().await });

        let job = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let job = self.queue.fetch(id).await.unwrap().unwrap();
                if job.status.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("job did not settle");

        self.executor.shutdown();
        handle.await.unwrap().unwrap();
        job
    }
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=r1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id_token": "bearer-u1",
            "expires_in": "3600"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_compress_then_upload_delivers_compressed_artifact() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/upload"))
        .and(header("authorization", "Bearer bearer-u1"))
        .and(body_string_contains("HEVC:raw video"))
        .and(body_string_contains("Trips"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(&server, FakeToolkit::default(), Duration::from_secs(60));
    let staged = harness.stage_file("trip.mp4", "raw video");

    let submitted = harness
        .pipeline
        .submit(SubmitRequest::new(
            &staged,
            UploadContext::new("u1", "r1").with_folder("Trips"),
        ))
        .await
        .unwrap();

    let upload = harness.run_until_settled(&submitted.upload).await;
    assert_eq!(upload.status, JobStatus::Succeeded, "{:?}", upload.error);

    let compress = harness
        .queue
        .fetch(submitted.compress.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    let artifact = PathBuf::from(compress.result.unwrap());

    assert_eq!(compress.status, JobStatus::Succeeded);
    assert_eq!(artifact, harness.dir.path().join("compressed").join("trip.mp4"));
    assert!(!staged.exists());
    assert!(!artifact.exists());
    assert_eq!(upload.result.map(PathBuf::from), Some(artifact));
}

#[tokio::test]
async fn test_upload_survives_two_unavailable_responses() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/upload"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(&server, FakeToolkit::default(), Duration::from_secs(60));
    let staged = harness.stage_file("clip.mp4", "already compressed");

    let submitted = harness
        .pipeline
        .submit(SubmitRequest::new(&staged, UploadContext::new("u1", "r1")).without_compression())
        .await
        .unwrap();

    let upload = harness.run_until_settled(&submitted.upload).await;

    assert_eq!(upload.status, JobStatus::Succeeded, "{:?}", upload.error);
    assert!(!staged.exists());
    assert!(harness.queue.failures().is_empty());
}

#[tokio::test]
async fn test_failed_compress_cancels_upload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new(&server, FakeToolkit::default(), Duration::from_secs(60));
    let missing = harness.dir.path().join("staging").join("missing.mp4");

    let submitted = harness
        .pipeline
        .submit(SubmitRequest::new(&missing, UploadContext::new("u1", "r1")))
        .await
        .unwrap();

    let upload = harness.run_until_settled(&submitted.upload).await;
    assert_eq!(upload.status, JobStatus::Canceled);

    let failures = harness.queue.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(Some(&failures[0].job_id), submitted.compress.as_ref());
}

#[tokio::test]
async fn test_compress_timeout_fails_job_and_keeps_source() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let toolkit = FakeToolkit {
        encode_delay: Some(Duration::from_secs(30)),
    };
    let harness = Harness::new(&server, toolkit, Duration::from_secs(1));
    let staged = harness.stage_file("slow.mp4", "raw video");

    let submitted = harness
        .pipeline
        .submit(SubmitRequest::new(&staged, UploadContext::new("u1", "r1")))
        .await
        .unwrap();
    let compress_id = submitted.compress.clone().unwrap();

    let compress = harness.run_until_settled(&compress_id).await;

    assert_eq!(compress.status, JobStatus::Failed);
    assert_eq!(compress.error.as_deref(), Some("timed out after 1 seconds"));
    assert!(staged.exists());
    assert!(!harness.dir.path().join("compressed").join("slow.mp4").exists());

    let upload = harness.queue.fetch(&submitted.upload).await.unwrap().unwrap();
    assert_eq!(upload.status, JobStatus::Canceled);
}
