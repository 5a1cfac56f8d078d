//! FFprobe stream inspection.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};
use crate::toolkit::MediaToolkit;

/// Codec names that identify the target (HEVC) family.
pub const TARGET_CODEC_ALIASES: [&str; 3] = ["hevc", "h265", "h.265"];

/// One stream as reported by `ffprobe -show_streams`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeStream {
    pub index: u32,
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub channels: Option<u32>,
    #[serde(default)]
    pub channel_layout: Option<String>,
}

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

/// Parse `ffprobe -print_format json` output.
pub fn parse_probe_output(stdout: &[u8]) -> MediaResult<Vec<ProbeStream>> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;
    Ok(probe.streams)
}

/// Audio stream descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStream {
    /// Absolute stream index in the container
    pub index: u32,
    /// Position among audio streams (the `N` in `0:a:N`)
    pub audio_index: usize,
    /// Codec name, lowercase
    pub codec: String,
    /// Channel layout (e.g. "stereo"), if reported
    pub channel_layout: Option<String>,
    /// Channel count, if reported
    pub channels: Option<u32>,
}

/// Inspection result for a media file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaArtifact {
    pub path: PathBuf,
    /// Lowercase codec of the first video stream, `None` if probing failed
    pub video_codec: Option<String>,
    pub audio_streams: Vec<AudioStream>,
}

impl MediaArtifact {
    /// True iff the detected video codec belongs to the target family.
    pub fn is_target_codec(&self) -> bool {
        self.video_codec
            .as_deref()
            .map(is_target_alias)
            .unwrap_or(false)
    }
}

fn is_target_alias(codec: &str) -> bool {
    TARGET_CODEC_ALIASES.contains(&codec)
}

/// Lowercase codec name of the first video stream.
pub async fn probe_video_codec(
    toolkit: &dyn MediaToolkit,
    path: impl AsRef<Path>,
) -> MediaResult<String> {
    let path = path.as_ref();
    let streams = toolkit.probe_streams(path, "v:0").await?;

    let codec = streams
        .first()
        .and_then(|s| s.codec_name.as_deref())
        .map(str::to_lowercase)
        .ok_or_else(|| {
            MediaError::probe_failed(format!("no video stream in {}", path.display()))
        })?;

    debug!(path = %path.display(), codec = %codec, "Detected video codec");
    Ok(codec)
}

/// Audio streams in container order. Empty when the file has no audio.
pub async fn probe_audio_streams(
    toolkit: &dyn MediaToolkit,
    path: impl AsRef<Path>,
) -> MediaResult<Vec<AudioStream>> {
    let path = path.as_ref();
    let streams = toolkit.probe_streams(path, "a").await?;

    let audio: Vec<AudioStream> = streams
        .into_iter()
        .enumerate()
        .map(|(audio_index, s)| AudioStream {
            index: s.index,
            audio_index,
            codec: s.codec_name.unwrap_or_default().to_lowercase(),
            channel_layout: s.channel_layout,
            channels: s.channels,
        })
        .collect();

    debug!(path = %path.display(), count = audio.len(), "Detected audio streams");
    Ok(audio)
}

/// Probe codec and audio layout. Probe failures degrade to an unknown codec
/// and no audio streams.
pub async fn inspect(toolkit: &dyn MediaToolkit, path: impl AsRef<Path>) -> MediaArtifact {
    let path = path.as_ref();

    let video_codec = match probe_video_codec(toolkit, path).await {
        Ok(codec) => Some(codec),
        Err(e) => {
            warn!(path = %path.display(), "Video codec probe failed: {}", e);
            None
        }
    };

    let audio_streams = match probe_audio_streams(toolkit, path).await {
        Ok(streams) => streams,
        Err(e) => {
            warn!(path = %path.display(), "Audio stream probe failed: {}", e);
            Vec::new()
        }
    };

    MediaArtifact {
        path: path.to_path_buf(),
        video_codec,
        audio_streams,
    }
}

/// True iff the file's video codec is in the target family.
///
/// A failed probe answers `false`, so the file gets re-encoded.
pub async fn is_target_codec(toolkit: &dyn MediaToolkit, path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    match probe_video_codec(toolkit, path).await {
        Ok(codec) => is_target_alias(&codec),
        Err(e) => {
            warn!(
                path = %path.display(),
                "Codec probe failed, treating as not target codec: {}", e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::FfmpegCommand;
    use async_trait::async_trait;

    struct ProbeOnly {
        video: MediaResult<Vec<ProbeStream>>,
        audio: Vec<ProbeStream>,
    }

    #[async_trait]
    impl MediaToolkit for ProbeOnly {
        async fn probe_streams(&self, _path: &Path, selector: &str) -> MediaResult<Vec<ProbeStream>> {
            if selector.starts_with('v') {
                match &self.video {
                    Ok(streams) => Ok(streams.clone()),
                    Err(_) => Err(MediaError::FfprobeFailed {
                        message: "exit 1".into(),
                        stderr: None,
                    }),
                }
            } else {
                Ok(self.audio.clone())
            }
        }

        async fn run(&self, _cmd: &FfmpegCommand) -> MediaResult<()> {
            unreachable!("probe tests never encode")
        }

        async fn run_captured(&self, _cmd: &FfmpegCommand) -> MediaResult<String> {
            unreachable!("probe tests never encode")
        }
    }

    fn video(codec: &str) -> ProbeStream {
        ProbeStream {
            index: 0,
            codec_type: Some("video".into()),
            codec_name: Some(codec.into()),
            ..Default::default()
        }
    }

    fn audio(index: u32, layout: &str) -> ProbeStream {
        ProbeStream {
            index,
            codec_type: Some("audio".into()),
            codec_name: Some("AAC".into()),
            channels: Some(2),
            channel_layout: Some(layout.into()),
        }
    }

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{"streams":[{"index":1,"codec_name":"aac","codec_type":"audio","channels":2,"channel_layout":"stereo"}]}"#;
        let streams = parse_probe_output(json).unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].channel_layout.as_deref(), Some("stereo"));

        let empty = parse_probe_output(b"{}").unwrap();
        assert!(empty.is_empty());

        assert!(parse_probe_output(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_probe_video_codec_lowercases() {
        let toolkit = ProbeOnly {
            video: Ok(vec![video("HEVC")]),
            audio: vec![],
        };
        assert_eq!(probe_video_codec(&toolkit, "a.mp4").await.unwrap(), "hevc");
    }

    #[tokio::test]
    async fn test_probe_video_codec_without_video_stream() {
        let toolkit = ProbeOnly {
            video: Ok(vec![]),
            audio: vec![],
        };
        let err = probe_video_codec(&toolkit, "a.mp4").await.unwrap_err();
        assert!(matches!(err, MediaError::ProbeFailed(_)));
    }

    #[tokio::test]
    async fn test_is_target_codec_aliases() {
        for codec in ["hevc", "h265", "H.265"] {
            let toolkit = ProbeOnly {
                video: Ok(vec![video(codec)]),
                audio: vec![],
            };
            assert!(is_target_codec(&toolkit, "a.mp4").await, "{codec}");
        }

        let h264 = ProbeOnly {
            video: Ok(vec![video("h264")]),
            audio: vec![],
        };
        assert!(!is_target_codec(&h264, "a.mp4").await);
    }

    #[tokio::test]
    async fn test_is_target_codec_false_on_probe_failure() {
        let toolkit = ProbeOnly {
            video: Err(MediaError::probe_failed("boom")),
            audio: vec![],
        };
        assert!(!is_target_codec(&toolkit, "a.mp4").await);
    }

    #[tokio::test]
    async fn test_audio_streams_keep_order() {
        let toolkit = ProbeOnly {
            video: Ok(vec![video("h264")]),
            audio: vec![audio(1, "stereo"), audio(2, "mono")],
        };

        let streams = probe_audio_streams(&toolkit, "a.mp4").await.unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].audio_index, 0);
        assert_eq!(streams[1].index, 2);
        assert_eq!(streams[1].channel_layout.as_deref(), Some("mono"));
        assert_eq!(streams[0].codec, "aac");
    }

    #[tokio::test]
    async fn test_inspect_degrades_on_probe_failure() {
        let toolkit = ProbeOnly {
            video: Err(MediaError::probe_failed("boom")),
            audio: vec![audio(1, "stereo")],
        };

        let artifact = inspect(&toolkit, "a.mp4").await;
        assert_eq!(artifact.video_codec, None);
        assert!(!artifact.is_target_codec());
        assert_eq!(artifact.audio_streams.len(), 1);
    }
}
