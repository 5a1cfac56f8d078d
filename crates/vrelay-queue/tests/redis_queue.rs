//! Redis backend integration tests.

use std::time::Duration;

use vrelay_models::{Job, JobStatus, Stage, UploadContext};
use vrelay_queue::{JobBackend, JobQueue, QueueConfig};

const BLOCK: Duration = Duration::from_millis(200);

async fn queue() -> JobQueue {
    dotenvy::dotenv().ok();

    // Fresh key space per test run
    let config = QueueConfig {
        prefix: format!("vrelay-test-{}", unique_suffix()),
        ..QueueConfig::from_env()
    };
    let queue = JobQueue::new(config).expect("Failed to create queue");
    queue.init().await.expect("Failed to initialize queue");
    queue
}

fn unique_suffix() -> String {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string()
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_dependency_release_and_result() {
    let queue = queue().await;

    let compress = queue.submit(Job::compress("/staging/a.mp4", 60)).await.unwrap();
    let upload = queue
        .submit(Job::upload_after(compress.id.clone(), UploadContext::new("u1", "r1"), 60))
        .await
        .unwrap();
    assert_eq!(upload.status, JobStatus::Deferred);

    let reserved = queue.reserve("test", &[Stage::Compress], BLOCK, 1).await.unwrap();
    assert_eq!(reserved.len(), 1);
    queue.complete(&reserved[0], "/compressed/a.mp4").await.unwrap();

    let reserved = queue.reserve("test", &[Stage::Upload], BLOCK, 1).await.unwrap();
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].job.id, upload.id);
    assert_eq!(
        queue.dependency_result(&reserved[0].job).await.unwrap(),
        Some("/compressed/a.mp4".into())
    );
    queue.complete(&reserved[0], "delivered").await.unwrap();

    assert_eq!(
        queue.fetch(&upload.id).await.unwrap().unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_failure_cancels_dependent_and_is_recorded() {
    let queue = queue().await;

    let compress = queue.submit(Job::compress("/staging/b.mp4", 60)).await.unwrap();
    let upload = queue
        .submit(Job::upload_after(compress.id.clone(), UploadContext::new("u1", "r1"), 60))
        .await
        .unwrap();

    let reserved = queue.reserve("test", &[Stage::Compress], BLOCK, 1).await.unwrap();
    queue.fail(&reserved[0], "encode failed").await.unwrap();

    assert_eq!(
        queue.fetch(&upload.id).await.unwrap().unwrap().status,
        JobStatus::Canceled
    );
    assert!(queue
        .reserve("test", &[Stage::Upload], BLOCK, 1)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(queue.failed_len().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_canceled_job_is_never_reserved() {
    let queue = queue().await;

    let job = queue.submit(Job::compress("/staging/c.mp4", 60)).await.unwrap();
    queue.cancel(&job.id, "user request").await.unwrap();

    assert!(queue
        .reserve("test", &[Stage::Compress], BLOCK, 1)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_abandoned_job_is_reclaimed_and_failed() {
    let queue = queue().await;

    let compress = queue.submit(Job::compress("/staging/d.mp4", 1)).await.unwrap();
    let upload = queue
        .submit(Job::upload_after(compress.id.clone(), UploadContext::new("u1", "r1"), 60))
        .await
        .unwrap();

    // Reserved by a worker that dies before settling
    let held = queue.reserve("gone", &[Stage::Compress], BLOCK, 1).await.unwrap();
    assert_eq!(held.len(), 1);

    let grace = Duration::from_millis(200);
    assert!(queue
        .recover_stale("rescuer", &[Stage::Compress], grace)
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let recovered = queue
        .recover_stale("rescuer", &[Stage::Compress], grace)
        .await
        .unwrap();
    assert_eq!(recovered, vec![compress.id.clone()]);

    let compress = queue.fetch(&compress.id).await.unwrap().unwrap();
    assert_eq!(compress.status, JobStatus::Failed);
    assert_eq!(compress.error.as_deref(), Some("timed out after 1 seconds"));
    assert_eq!(
        queue.fetch(&upload.id).await.unwrap().unwrap().status,
        JobStatus::Canceled
    );
    assert_eq!(queue.failed_len().await.unwrap(), 1);

    // The late settle from the dead worker is rejected
    assert!(queue.complete(&held[0], "/compressed/d.mp4").await.is_err());
}
