//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during media processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Loudness measurement unusable: {0}")]
    LoudnessMeasurement(String),

    #[error("Encode failed (primary: {primary}; fallback: {fallback})")]
    EncodeFailed { primary: String, fallback: String },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Output would overwrite input: {0}")]
    OutputIsInput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl MediaError {
    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create a probe failure error.
    pub fn probe_failed(message: impl Into<String>) -> Self {
        Self::ProbeFailed(message.into())
    }

    /// Create a loudness measurement error.
    pub fn loudness(message: impl Into<String>) -> Self {
        Self::LoudnessMeasurement(message.into())
    }

    /// Tail of the captured stderr, if any, for log lines.
    pub fn stderr_tail(&self) -> Option<&str> {
        let stderr = match self {
            Self::FfmpegFailed { stderr, .. } | Self::FfprobeFailed { stderr, .. } => {
                stderr.as_deref()?
            }
            _ => return None,
        };
        let start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL_CHARS - 1)
            .map(|(i, _)| i)
            .unwrap_or(0);
        Some(&stderr[start..])
    }
}

const STDERR_TAIL_CHARS: usize = 2000;
