//! Two-pass audio normalization.
//!
//! Produces a file whose first audio track is a loudness-normalized mix of
//! the system (`0:a:0`) and microphone (`0:a:1`) tracks, followed by both
//! original tracks copied bit-for-bit and flagged non-default. Video is
//! copied untouched. Any failure skips normalization; the caller keeps
//! working on the unmodified source.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::command::FfmpegCommand;
use crate::error::MediaResult;
use crate::fs_utils::remove_if_exists;
use crate::loudness::{parse_loudnorm_report, LoudnessMeasurement, LoudnessTarget};
use crate::probe::{AudioStream, MediaArtifact};
use crate::toolkit::MediaToolkit;

/// Default location of the RNNoise model inside the worker image.
pub const DEFAULT_DENOISE_MODEL: &str = "/app/models/rnnoise-model.rnnn";

/// Normalization settings.
#[derive(Debug, Clone)]
pub struct NormalizeSettings {
    /// Denoise the microphone track before mixing
    pub denoise: bool,
    /// RNNoise model used by `arnndn`
    pub denoise_model: PathBuf,
    /// Loudness the mix is corrected to
    pub target: LoudnessTarget,
    /// Bitrate of the encoded mix track
    pub mix_bitrate: String,
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            denoise: false,
            denoise_model: PathBuf::from(DEFAULT_DENOISE_MODEL),
            target: LoudnessTarget::default(),
            mix_bitrate: "256k".to_string(),
        }
    }
}

/// Result of a normalization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeOutcome {
    /// Normalized file written; describes the new three-track layout
    Normalized(MediaArtifact),
    /// Nothing written; continue with the source file
    Skipped(String),
}

/// Build the normalized mix of `source` at `output`.
///
/// Never returns an error: every failure is logged and reported as
/// [`NormalizeOutcome::Skipped`], with any partial output removed.
pub async fn normalize_audio(
    toolkit: &dyn MediaToolkit,
    source: &MediaArtifact,
    output: &Path,
    settings: &NormalizeSettings,
) -> NormalizeOutcome {
    let input = source.path.as_path();
    let streams = &source.audio_streams;

    if streams.len() < 2 {
        info!(
            path = %input.display(),
            audio_streams = streams.len(),
            "Fewer than 2 audio streams, skipping normalization"
        );
        return NormalizeOutcome::Skipped(format!("{} audio stream(s)", streams.len()));
    }

    let mic = mic_branch(settings);

    match run_passes(toolkit, input, output, &mic, settings).await {
        Ok(()) => {
            info!(path = %output.display(), "Audio normalization complete");
            NormalizeOutcome::Normalized(normalized_artifact(source, output))
        }
        Err(e) => {
            warn!(path = %input.display(), "Audio normalization failed, using source: {}", e);
            if let Some(stderr) = e.stderr_tail() {
                debug!("FFmpeg stderr: {}", stderr);
            }
            if let Err(rm) = remove_if_exists(output).await {
                warn!(path = %output.display(), "Failed to remove partial output: {}", rm);
            }
            NormalizeOutcome::Skipped(format!("ffmpeg failed: {e}"))
        }
    }
}

/// Layout written by the apply pass: the mix, then both raw tracks.
fn normalized_artifact(source: &MediaArtifact, output: &Path) -> MediaArtifact {
    let mix = AudioStream {
        index: 1,
        audio_index: 0,
        codec: "aac".to_string(),
        channel_layout: None,
        channels: None,
    };
    let raw = source.audio_streams.iter().take(2).enumerate().map(|(i, s)| AudioStream {
        index: i as u32 + 2,
        audio_index: i + 1,
        ..s.clone()
    });

    MediaArtifact {
        path: output.to_path_buf(),
        video_codec: source.video_codec.clone(),
        audio_streams: std::iter::once(mix).chain(raw).collect(),
    }
}

async fn run_passes(
    toolkit: &dyn MediaToolkit,
    input: &Path,
    output: &Path,
    mic: &str,
    settings: &NormalizeSettings,
) -> MediaResult<()> {
    let work_dir = output.parent().unwrap_or_else(|| Path::new("."));
    let measure_file = tempfile::Builder::new()
        .prefix("loudness_")
        .suffix(".wav")
        .tempfile_in(work_dir)?
        .into_temp_path();

    let measured = measure(toolkit, input, &measure_file, mic, &settings.target).await;

    // Best-effort: ffmpeg may have replaced or never created the file
    if let Err(e) = measure_file.close() {
        debug!("Measurement file already gone: {}", e);
    }

    let measurement = measured?;
    debug!(
        input_i = measurement.input_i,
        input_tp = measurement.input_tp,
        input_lra = measurement.input_lra,
        input_thresh = measurement.input_thresh,
        "Measured mix loudness"
    );

    toolkit
        .run(&apply_command(input, output, mic, &measurement, settings))
        .await
}

/// Mic-branch filter: denoised when enabled and the model is present.
fn mic_branch(settings: &NormalizeSettings) -> String {
    if settings.denoise {
        if settings.denoise_model.exists() {
            info!("Denoising mic track before mixing");
            return format!(
                "[0:a:1]arnndn=m={}[mic]",
                escape_filter_path(&settings.denoise_model)
            );
        }
        warn!(
            model = %settings.denoise_model.display(),
            "Denoise enabled but model not found; mixing raw mic"
        );
    }
    "[0:a:1]anull[mic]".to_string()
}

fn mix_graph(mic: &str) -> String {
    format!("{mic};[0:a:0][mic]amix=inputs=2:duration=longest:normalize=0[a_mix]")
}

/// Measurement pass: render the loudnorm-analysed mix to a lossless file.
async fn measure(
    toolkit: &dyn MediaToolkit,
    input: &Path,
    measure_file: &Path,
    mic: &str,
    target: &LoudnessTarget,
) -> MediaResult<LoudnessMeasurement> {
    let cmd = FfmpegCommand::new(input, measure_file)
        .without_progress()
        .log_level("info")
        .filter_complex(format!(
            "{};[a_mix]{}[a_meas]",
            mix_graph(mic),
            target.measure_filter()
        ))
        .map("[a_meas]")
        .codec("a", "pcm_s16le");

    let stderr = toolkit.run_captured(&cmd).await?;
    parse_loudnorm_report(&stderr)
}

/// Apply pass: normalized mix first, then both raw tracks.
fn apply_command(
    input: &Path,
    output: &Path,
    mic: &str,
    measurement: &LoudnessMeasurement,
    settings: &NormalizeSettings,
) -> FfmpegCommand {
    let graph = format!(
        "{};[a_mix]{},aresample=48000[a_norm]",
        mix_graph(mic),
        settings.target.apply_filter(measurement)
    );

    FfmpegCommand::new(input, output)
        .filter_complex(graph)
        // Video: passthrough
        .map("0:v:0")
        .codec("v", "copy")
        // 1) Normalized mix, default
        .map("[a_norm]")
        .codec("a:0", "aac")
        .output_args(["-b:a:0", settings.mix_bitrate.as_str()])
        .stream_metadata("a:0", "title", "Default mix (system + mic)")
        .stream_metadata("a:0", "language", "eng")
        .disposition("a:0", "default")
        // 2) Original system audio
        .map("0:a:0")
        .codec("a:1", "copy")
        .stream_metadata("a:1", "title", "System only (raw)")
        .stream_metadata("a:1", "language", "eng")
        .disposition("a:1", "0")
        // 3) Original mic audio
        .map("0:a:1")
        .codec("a:2", "copy")
        .stream_metadata("a:2", "title", "Mic only (raw)")
        .stream_metadata("a:2", "language", "eng")
        .disposition("a:2", "0")
        .faststart()
}

// Filter-graph option values treat ':' and '\' specially.
fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::probe::ProbeStream;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const REPORT: &str = r#"{
        "input_i" : "-24.00", "input_tp" : "-3.00", "input_lra" : "7.00",
        "input_thresh" : "-34.00", "target_offset" : "0.10"
    }"#;

    /// Records invocations and fakes ffmpeg by writing the output file.
    struct FakeToolkit {
        fail_apply: bool,
        report: String,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeToolkit {
        fn new() -> Self {
            Self {
                fail_apply: false,
                report: REPORT.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaToolkit for FakeToolkit {
        async fn probe_streams(&self, _path: &Path, _selector: &str) -> MediaResult<Vec<ProbeStream>> {
            unreachable!("normalization works from an inspected artifact")
        }

        async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
            self.calls.lock().unwrap().push(cmd.build_args());
            let output = cmd.output();
            tokio::fs::write(output, b"partial").await?;
            if self.fail_apply {
                return Err(MediaError::ffmpeg_failed("exit 1", None, Some(1)));
            }
            Ok(())
        }

        async fn run_captured(&self, cmd: &FfmpegCommand) -> MediaResult<String> {
            self.calls.lock().unwrap().push(cmd.build_args());
            Ok(format!("[Parsed_loudnorm_1 @ 0x1]\n{}", self.report))
        }
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"source").unwrap();
        let output = dir.path().join("audio_processed_in.mp4");
        (dir, input, output)
    }

    fn source(input: &Path, audio_streams: usize) -> MediaArtifact {
        MediaArtifact {
            path: input.to_path_buf(),
            video_codec: Some("h264".into()),
            audio_streams: (0..audio_streams)
                .map(|i| AudioStream {
                    index: i as u32 + 1,
                    audio_index: i,
                    codec: "aac".into(),
                    channel_layout: Some("stereo".into()),
                    channels: Some(2),
                })
                .collect(),
        }
    }

    fn leftover_measure_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("loudness_")
            })
            .count()
    }

    #[tokio::test]
    async fn test_skips_with_fewer_than_two_streams() {
        let (_dir, input, output) = setup();
        for count in [0, 1] {
            let toolkit = FakeToolkit::new();
            let outcome = normalize_audio(
                &toolkit,
                &source(&input, count),
                &output,
                &NormalizeSettings::default(),
            )
            .await;

            assert!(matches!(outcome, NormalizeOutcome::Skipped(_)));
            assert!(toolkit.calls().is_empty());
        }
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_two_passes_with_linear_correction() {
        let (dir, input, output) = setup();
        let toolkit = FakeToolkit::new();

        let outcome =
            normalize_audio(&toolkit, &source(&input, 2), &output, &NormalizeSettings::default()).await;
        let NormalizeOutcome::Normalized(artifact) = outcome else {
            panic!("expected normalized output");
        };
        assert_eq!(artifact.path, output);
        assert_eq!(artifact.video_codec.as_deref(), Some("h264"));
        assert_eq!(artifact.audio_streams.len(), 3);
        assert_eq!(artifact.audio_streams[2].audio_index, 2);
        assert_eq!(artifact.audio_streams[2].channel_layout.as_deref(), Some("stereo"));

        let calls = toolkit.calls();
        assert_eq!(calls.len(), 2);

        let measure = calls[0].join(" ");
        assert!(measure.contains("print_format=json"));
        assert!(measure.contains("[0:a:1]anull[mic]"));
        assert!(measure.contains("pcm_s16le"));

        let apply = &calls[1];
        let apply_line = apply.join(" ");
        assert!(apply_line.contains("measured_I=-24"));
        assert!(apply_line.contains("linear=true"));
        assert!(apply.windows(2).any(|w| w == ["-disposition:a:0", "default"]));
        assert!(apply.windows(2).any(|w| w == ["-disposition:a:1", "0"]));
        assert!(apply.windows(2).any(|w| w == ["-disposition:a:2", "0"]));
        assert!(apply.windows(2).any(|w| w == ["-c:a:1", "copy"]));
        assert!(apply.windows(2).any(|w| w == ["-c:a:2", "copy"]));
        assert!(apply.windows(2).any(|w| w == ["-c:v", "copy"]));

        assert_eq!(leftover_measure_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_denoise_uses_model_when_present() {
        let (dir, input, output) = setup();
        let model = dir.path().join("rnnoise.rnnn");
        std::fs::write(&model, b"model").unwrap();

        let toolkit = FakeToolkit::new();
        let settings = NormalizeSettings {
            denoise: true,
            denoise_model: model,
            ..Default::default()
        };
        normalize_audio(&toolkit, &source(&input, 2), &output, &settings).await;

        let apply_line = toolkit.calls()[1].join(" ");
        assert!(apply_line.contains("arnndn=m="));
    }

    #[tokio::test]
    async fn test_denoise_falls_back_when_model_missing() {
        let (dir, input, output) = setup();
        let toolkit = FakeToolkit::new();
        let settings = NormalizeSettings {
            denoise: true,
            denoise_model: dir.path().join("missing.rnnn"),
            ..Default::default()
        };

        let outcome = normalize_audio(&toolkit, &source(&input, 2), &output, &settings).await;
        assert!(matches!(outcome, NormalizeOutcome::Normalized(_)));
        assert!(toolkit.calls()[0].join(" ").contains("anull[mic]"));
    }

    #[tokio::test]
    async fn test_unparseable_measurement_skips() {
        let (dir, input, output) = setup();
        let mut toolkit = FakeToolkit::new();
        toolkit.report = "no report here".to_string();

        let outcome =
            normalize_audio(&toolkit, &source(&input, 2), &output, &NormalizeSettings::default()).await;
        assert!(matches!(outcome, NormalizeOutcome::Skipped(_)));
        assert_eq!(toolkit.calls().len(), 1);
        assert_eq!(leftover_measure_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_apply_failure_skips_and_removes_partial_output() {
        let (_dir, input, output) = setup();
        let mut toolkit = FakeToolkit::new();
        toolkit.fail_apply = true;

        let outcome =
            normalize_audio(&toolkit, &source(&input, 2), &output, &NormalizeSettings::default()).await;
        assert!(matches!(outcome, NormalizeOutcome::Skipped(_)));
        assert!(!output.exists());
        assert!(input.exists());
    }

    #[test]
    fn test_escape_filter_path() {
        assert_eq!(
            escape_filter_path(Path::new("C:\\models\\rn.rnnn")),
            "C\\:\\\\models\\\\rn.rnnn"
        );
    }
}
