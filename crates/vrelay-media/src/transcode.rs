//! Conditional HEVC transcoding of a staged upload.
//!
//! Flow: inspect the input once. Already HEVC: relocate it untouched.
//! Otherwise normalize audio into an intermediate and re-encode that into
//! the compressed directory.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::command::FfmpegCommand;
use crate::error::{MediaError, MediaResult};
use crate::fs_utils::{ensure_parent, move_file, remove_if_exists};
use crate::normalize::{normalize_audio, NormalizeOutcome, NormalizeSettings};
use crate::probe::inspect;
use crate::toolkit::MediaToolkit;

/// Prefix of the normalized intermediate written next to the input.
pub const INTERMEDIATE_PREFIX: &str = "audio_processed_";

/// Video encoding settings.
#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    /// Directory compressed artifacts are written to. When unset, a
    /// `compressed` directory beside the input's parent directory is used.
    pub output_dir: Option<PathBuf>,
    pub encoder: String,
    pub crf: u8,
    pub preset: String,
    /// Codec tag written for player compatibility
    pub tag: String,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            output_dir: None,
            encoder: "libx265".to_string(),
            crf: 22,
            preset: "medium".to_string(),
            tag: "hvc1".to_string(),
        }
    }
}

impl TranscodeSettings {
    /// Final location of the compressed artifact for `input`.
    pub fn output_path(&self, input: &Path) -> MediaResult<PathBuf> {
        let name = input
            .file_name()
            .ok_or_else(|| MediaError::FileNotFound(input.to_path_buf()))?;

        let dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => input
                .parent()
                .and_then(Path::parent)
                .unwrap_or_else(|| Path::new("."))
                .join("compressed"),
        };
        Ok(dir.join(name))
    }
}

/// Settings for the whole compress stage.
#[derive(Debug, Clone, Default)]
pub struct CompressSettings {
    pub transcode: TranscodeSettings,
    pub normalize: NormalizeSettings,
}

/// Compress `input` and return the path of the resulting artifact.
///
/// An input already in the target codec is moved as is, with no
/// normalization or re-encode. Otherwise the audio is normalized into an
/// intermediate and the result re-encoded.
///
/// On success the input (and any intermediate) is gone and exactly one
/// artifact exists at the returned path. On failure, or when the returned
/// future is dropped before completion, the input is kept and the partial
/// output and intermediate are removed.
pub async fn compress_video(
    toolkit: &dyn MediaToolkit,
    input: &Path,
    settings: &CompressSettings,
) -> MediaResult<PathBuf> {
    if !input.exists() {
        return Err(MediaError::FileNotFound(input.to_path_buf()));
    }

    let output = settings.transcode.output_path(input)?;
    if output == input {
        return Err(MediaError::OutputIsInput(output));
    }
    ensure_parent(&output).await?;

    let start = Instant::now();
    let source = inspect(toolkit, input).await;

    if source.is_target_codec() {
        info!(
            path = %input.display(),
            output = %output.display(),
            "Already target codec, relocating without re-encode"
        );
        move_file(input, &output).await?;
        return Ok(output);
    }

    let intermediate = intermediate_path(input)?;
    let mut pending = PendingFiles::new([output.clone(), intermediate.clone()]);

    let encode_source = match normalize_audio(toolkit, &source, &intermediate, &settings.normalize).await {
        NormalizeOutcome::Normalized(artifact) => artifact,
        NormalizeOutcome::Skipped(reason) => {
            info!(path = %input.display(), "Normalization skipped: {}", reason);
            source
        }
    };
    let audio_count = encode_source.audio_streams.len();

    info!(
        input = %encode_source.path.display(),
        output = %output.display(),
        audio_streams = audio_count,
        "Re-encoding to {}",
        settings.transcode.encoder
    );

    encode(toolkit, &encode_source.path, &output, audio_count, &settings.transcode).await?;

    pending.keep(&output);
    discard(&[intermediate.as_path(), input]).await;
    info!(
        output = %output.display(),
        elapsed_secs = start.elapsed().as_secs(),
        "Compression complete"
    );
    Ok(output)
}

/// Files removed on drop unless kept: a partial output and the normalized
/// intermediate. Covers early returns and cancellation alike.
struct PendingFiles {
    paths: Vec<PathBuf>,
}

impl PendingFiles {
    fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    /// Stop tracking `path`; it survives the drop.
    fn keep(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }
}

impl Drop for PendingFiles {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed unfinished file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to remove unfinished file: {}", e),
            }
        }
    }
}

fn intermediate_path(input: &Path) -> MediaResult<PathBuf> {
    let name = input
        .file_name()
        .ok_or_else(|| MediaError::FileNotFound(input.to_path_buf()))?;
    let mut intermediate = std::ffi::OsString::from(INTERMEDIATE_PREFIX);
    intermediate.push(name);
    Ok(input.with_file_name(intermediate))
}

/// Primary invocation, then one fallback with the classic flag spelling.
async fn encode(
    toolkit: &dyn MediaToolkit,
    source: &Path,
    output: &Path,
    audio_count: usize,
    settings: &TranscodeSettings,
) -> MediaResult<()> {
    let primary = match toolkit.run(&primary_command(source, output, audio_count, settings)).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    warn!(path = %source.display(), "Primary encode failed, trying fallback: {}", primary);
    if let Some(stderr) = primary.stderr_tail() {
        warn!("FFmpeg stderr: {}", stderr);
    }

    match toolkit
        .run_captured(&fallback_command(source, output, audio_count, settings))
        .await
    {
        Ok(_) => Ok(()),
        Err(fallback) => {
            if let Some(stderr) = fallback.stderr_tail() {
                warn!("Fallback FFmpeg stderr: {}", stderr);
            }
            Err(MediaError::EncodeFailed {
                primary: primary.to_string(),
                fallback: fallback.to_string(),
            })
        }
    }
}

fn primary_command(
    source: &Path,
    output: &Path,
    audio_count: usize,
    settings: &TranscodeSettings,
) -> FfmpegCommand {
    let cmd = FfmpegCommand::new(source, output)
        .map("0")
        .output_args(["-c", "copy"])
        .codec("v", settings.encoder.as_str())
        .crf(settings.crf)
        .preset(settings.preset.as_str())
        .output_args(["-tag:v", settings.tag.as_str()])
        .faststart()
        .output_args(["-map_metadata", "0"]);
    with_dispositions(cmd, audio_count)
}

fn fallback_command(
    source: &Path,
    output: &Path,
    audio_count: usize,
    settings: &TranscodeSettings,
) -> FfmpegCommand {
    let cmd = FfmpegCommand::new(source, output)
        .without_progress()
        .map("0:v:0")
        .map("0:a?")
        .map("0:s?")
        .output_args(["-vcodec", settings.encoder.as_str()])
        .crf(settings.crf)
        .preset(settings.preset.as_str())
        .output_args(["-acodec", "copy", "-scodec", "copy"])
        .output_args(["-vtag", settings.tag.as_str()])
        .faststart()
        .output_args(["-map_metadata", "0"]);
    with_dispositions(cmd, audio_count)
}

// First audio track default, every other one cleared.
fn with_dispositions(mut cmd: FfmpegCommand, audio_count: usize) -> FfmpegCommand {
    for i in 0..audio_count {
        let value = if i == 0 { "default" } else { "0" };
        cmd = cmd.disposition(&format!("a:{i}"), value);
    }
    cmd
}

async fn discard(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = remove_if_exists(path).await {
            warn!(path = %path.display(), "Failed to remove file: {}", e);
        }
    }
}
