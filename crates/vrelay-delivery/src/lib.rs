//! Delivery of compressed artifacts to the remote storage server.
//!
//! Each upload attempt exchanges the user's refresh token for a fresh bearer
//! token and streams the file as a multipart body. Attempts are wrapped by a
//! [`RetryPolicy`] whose classifier decides which failures are transient.

pub mod auth;
pub mod client;
pub mod error;
pub mod metrics;
pub mod progress;
pub mod retry;
pub mod uploader;

pub use auth::{AuthClient, AuthConfig, AuthSession};
pub use client::{UploadClient, UploadConfig};
pub use error::{DeliveryError, DeliveryResult};
pub use progress::DecileReporter;
pub use retry::{DeliveryClassifier, RetryClassifier, RetryDecision, RetryPolicy};
pub use uploader::Uploader;
