//! Delivery error types.

use std::path::PathBuf;

use thiserror::Error;

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("No input file: neither a dependency result nor an explicit path")]
    MissingInput,

    #[error("Input file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryError {
    /// Map a non-success HTTP status and its body.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: body.into(),
        }
    }

    /// HTTP status, if the failure came from a response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Transient failures: connection errors, timeouts, body transport
    /// errors and 5xx responses. Everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => {
                if let Some(status) = e.status() {
                    return status.is_server_error();
                }
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
            }
            Self::Http { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}
