//! Upload context carried in job metadata.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when an upload context fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("userId must not be empty")]
    MissingUserId,

    #[error("refreshToken must not be empty")]
    MissingRefreshToken,
}

/// Identity and destination metadata attached to an upload job at enqueue time.
///
/// Only the long-lived refresh credential is stored here. A bearer token
/// would expire while the job sits in the queue, so workers derive one on
/// every upload attempt instead.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadContext {
    /// Owner of the uploaded file
    pub user_id: String,
    /// Refresh credential exchanged for a bearer token by the worker
    pub refresh_token: String,
    /// Optional destination folder on the storage endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

impl UploadContext {
    /// Create a context without a destination folder.
    pub fn new(user_id: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            refresh_token: refresh_token.into(),
            folder: None,
        }
    }

    /// Set the destination folder.
    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Validate and normalize the context.
    ///
    /// A blank folder is treated as absent.
    pub fn validated(mut self) -> Result<Self, ContextError> {
        if self.user_id.trim().is_empty() {
            return Err(ContextError::MissingUserId);
        }
        if self.refresh_token.trim().is_empty() {
            return Err(ContextError::MissingRefreshToken);
        }
        self.folder = self
            .folder
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        Ok(self)
    }
}

impl fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadContext")
            .field("user_id", &self.user_id)
            .field("refresh_token", &"<redacted>")
            .field("folder", &self.folder)
            .finish()
    }
}
