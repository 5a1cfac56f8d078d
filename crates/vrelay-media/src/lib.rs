#![deny(unreachable_patterns)]
//! FFmpeg CLI wrapper for the compress stage.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:2`
//! - A `MediaToolkit` seam over ffprobe/ffmpeg invocations
//! - Stream inspection, two-pass loudness normalization and conditional
//!   HEVC transcoding

pub mod command;
pub mod error;
pub mod fs_utils;
pub mod loudness;
pub mod normalize;
pub mod probe;
pub mod progress;
pub mod toolkit;
pub mod transcode;

pub use command::FfmpegCommand;
pub use error::{MediaError, MediaResult};
pub use loudness::{LoudnessMeasurement, LoudnessTarget};
pub use normalize::{normalize_audio, NormalizeOutcome, NormalizeSettings};
pub use probe::{
    inspect, is_target_codec, probe_audio_streams, probe_video_codec, AudioStream,
    MediaArtifact, ProbeStream, TARGET_CODEC_ALIASES,
};
pub use progress::FfmpegProgress;
pub use toolkit::{FfmpegToolkit, MediaToolkit};
pub use transcode::{compress_video, CompressSettings, TranscodeSettings};
