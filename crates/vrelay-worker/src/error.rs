//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("timed out after {0} seconds")]
    TimedOut(u64),

    #[error("Invalid upload context: {0}")]
    Context(#[from] vrelay_models::ContextError),

    #[error("Media error: {0}")]
    Media(#[from] vrelay_media::MediaError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] vrelay_delivery::DeliveryError),

    #[error("Queue error: {0}")]
    Queue(#[from] vrelay_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        assert_eq!(WorkerError::TimedOut(30).to_string(), "timed out after 30 seconds");
    }
}
