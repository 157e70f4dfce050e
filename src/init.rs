use crate::config::Config;
use anyhow::Result;
use std::path::Path;
use tokio::fs;

/// Create the jobs directory if it is missing.
pub async fn ensure_directories(config: &Config) -> Result<()> {
    let jobs_dir = Path::new(&config.jobs_dir);
    if !jobs_dir.exists() {
        fs::create_dir_all(jobs_dir).await?;
        eprintln!("[INFO] Created directory: {}", config.jobs_dir);
    }
    Ok(())
}
