use std::path::Path;

use vrelay_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();

    let compressed_dir = config
        .compressed_dir
        .as_ref()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| "<beside staging dir>".to_string());
    println!(
        "worker-selfcheck: starting with stages={:?} compressed_dir={}",
        config.stages, compressed_dir
    );

    if let Some(dir) = &config.compressed_dir {
        ensure_dir(dir).await?;
    }
    ensure_binary("ffmpeg")?;
    ensure_binary("ffprobe")?;
    if config.enable_rnnoise && !config.rnnoise_model.exists() {
        println!(
            "worker-selfcheck: warning: RNNoise model {} missing, denoise will be skipped",
            config.rnnoise_model.display()
        );
    }
    ensure_env_present(&["REDIS_URL", "FIREBASE_API_KEY", "UPLOAD_SERVER_URL"])?;

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_dir(path: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

fn ensure_binary(name: &str) -> anyhow::Result<()> {
    let path = which::which(name).map_err(|e| anyhow::anyhow!("{} not available: {}", name, e))?;

    let output = std::process::Command::new(&path)
        .arg("-version")
        .output()
        .map_err(|e| anyhow::anyhow!("{} not runnable: {}", name, e))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("{} -version failed: {:?}", name, output.status));
    }
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
