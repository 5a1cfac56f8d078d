//! Delivery metrics.

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric name constants.
pub mod names {
    /// Retries performed, by operation.
    pub const RETRIES_TOTAL: &str = "vrelay_delivery_retries_total";

    /// Finished uploads, by outcome.
    pub const UPLOADS_TOTAL: &str = "vrelay_uploads_total";

    /// Wall time of a delivery including retries.
    pub const UPLOAD_SECONDS: &str = "vrelay_upload_seconds";
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record a finished delivery.
pub fn record_upload(success: bool, elapsed: Duration) {
    let outcome = if success { "success" } else { "failure" };
    counter!(names::UPLOADS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::UPLOAD_SECONDS, "outcome" => outcome).record(elapsed.as_secs_f64());
}
