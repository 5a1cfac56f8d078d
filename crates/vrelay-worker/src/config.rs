//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use vrelay_media::normalize::DEFAULT_DENOISE_MODEL;
use vrelay_media::{CompressSettings, NormalizeSettings, TranscodeSettings};
use vrelay_models::Stage;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Stage queues this worker consumes
    pub stages: Vec<Stage>,
    /// Where compressed artifacts land. Defaults to a `compressed` directory
    /// beside the staging directory.
    pub compressed_dir: Option<PathBuf>,
    /// Timeout recorded on compress jobs at submit time
    pub compress_timeout: Duration,
    /// Timeout recorded on upload jobs at submit time
    pub upload_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How long a single reserve call may block
    pub poll_interval: Duration,
    /// How often abandoned jobs are looked for
    pub recover_interval: Duration,
    /// Extra time past a job's limit before it counts as abandoned
    pub stale_grace: Duration,
    /// Denoise the microphone track before mixing
    pub enable_rnnoise: bool,
    pub rnnoise_model: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            stages: Stage::ALL.to_vec(),
            compressed_dir: None,
            compress_timeout: Duration::from_secs(4 * 3600),
            upload_timeout: Duration::from_secs(8 * 3600),
            shutdown_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            recover_interval: Duration::from_secs(30),
            stale_grace: Duration::from_secs(60),
            enable_rnnoise: false,
            rnnoise_model: PathBuf::from(DEFAULT_DENOISE_MODEL),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: env_parse::<usize>("WORKER_MAX_JOBS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            stages: std::env::var("WORKER_STAGES")
                .ok()
                .map(|s| parse_stages(&s))
                .filter(|stages| !stages.is_empty())
                .unwrap_or(defaults.stages),
            compressed_dir: std::env::var("WORKER_COMPRESSED_DIR")
                .ok()
                .filter(|d| !d.trim().is_empty())
                .map(PathBuf::from),
            compress_timeout: env_parse("WORKER_COMPRESS_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.compress_timeout),
            upload_timeout: env_parse("WORKER_UPLOAD_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.upload_timeout),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            poll_interval: env_parse("WORKER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            recover_interval: env_parse::<u64>("WORKER_RECOVER_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.recover_interval),
            stale_grace: env_parse("WORKER_STALE_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_grace),
            enable_rnnoise: std::env::var("ENABLE_RNNOISE")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            rnnoise_model: std::env::var("RNNOISE_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.rnnoise_model),
        }
    }

    /// Media settings for the compress stage.
    pub fn compress_settings(&self) -> CompressSettings {
        CompressSettings {
            transcode: TranscodeSettings {
                output_dir: self.compressed_dir.clone(),
                ..TranscodeSettings::default()
            },
            normalize: NormalizeSettings {
                denoise: self.enable_rnnoise,
                denoise_model: self.rnnoise_model.clone(),
                ..NormalizeSettings::default()
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse a comma-separated stage list, ignoring unknown names.
fn parse_stages(value: &str) -> Vec<Stage> {
    let mut stages = Vec::new();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match Stage::parse(name) {
            Some(stage) if !stages.contains(&stage) => stages.push(stage),
            Some(_) => {}
            None => tracing::warn!(stage = name, "Ignoring unknown stage in WORKER_STAGES"),
        }
    }
    stages
}
