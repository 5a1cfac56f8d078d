//! Seam over the external ffprobe/ffmpeg binaries.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use crate::command::{check_ffprobe, FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::{parse_probe_output, ProbeStream};

/// External media capabilities used by the compress stage.
///
/// `FfmpegToolkit` shells out to the real binaries; tests substitute a fake.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// List the streams matched by an ffprobe stream selector (`v:0`, `a`, ...).
    async fn probe_streams(&self, path: &Path, selector: &str) -> MediaResult<Vec<ProbeStream>>;

    /// Run an encode with progress tracking.
    async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()>;

    /// Run to completion and return stderr, for passes whose diagnostics are parsed.
    async fn run_captured(&self, cmd: &FfmpegCommand) -> MediaResult<String>;
}

/// `MediaToolkit` backed by the ffprobe/ffmpeg binaries in PATH.
#[derive(Debug, Default, Clone)]
pub struct FfmpegToolkit {
    runner: FfmpegRunner,
}

impl FfmpegToolkit {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe_streams(&self, path: &Path, selector: &str) -> MediaResult<Vec<ProbeStream>> {
        if !path.exists() {
            return Err(MediaError::FileNotFound(path.to_path_buf()));
        }

        check_ffprobe()?;

        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-select_streams",
                selector,
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(MediaError::FfprobeFailed {
                message: format!("FFprobe exited with {}", output.status),
                stderr: Some(String::from_utf8_lossy(&output.stderr).to_string()),
            });
        }

        parse_probe_output(&output.stdout)
    }

    async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        self.runner
            .run_with_progress(cmd, |progress| {
                trace!(
                    frame = progress.frame,
                    out_time_secs = progress.out_time_secs(),
                    speed = progress.speed,
                    "FFmpeg progress"
                );
            })
            .await
    }

    async fn run_captured(&self, cmd: &FfmpegCommand) -> MediaResult<String> {
        self.runner.run_captured(cmd).await
    }
}
