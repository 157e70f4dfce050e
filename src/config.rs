use crate::continuity::ChainSettings;
use crate::poller::PollPolicy;
use crate::provider::ModelTarget;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

pub const MOCK_PROVIDER: &str = "mock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Image,
    Enhance,
    Video,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub replicate_api_token: String,
    #[serde(rename = "open_api_key", alias = "openai_api_key", default)]
    pub openai_key: String,

    /// Generation provider: "replicate" or "mock".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_enhance_model")]
    pub enhance_model: String,
    #[serde(default = "default_video_model")]
    pub video_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_planner_model")]
    pub planner_model: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_image_max_ticks")]
    pub image_max_ticks: u32,
    #[serde(default = "default_enhance_max_ticks")]
    pub enhance_max_ticks: u32,
    #[serde(default = "default_video_max_ticks")]
    pub video_max_ticks: u32,
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,

    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: String,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_enhance")]
    pub enhance: bool,
}

fn default_provider() -> String {
    "replicate".to_string()
}

fn default_image_model() -> String {
    "google/nano-banana".to_string()
}

fn default_enhance_model() -> String {
    "google/nano-banana".to_string()
}

fn default_video_model() -> String {
    "kwaivgi/kling-v2.1".to_string()
}

fn default_vision_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_planner_model() -> String {
    "gpt-5.2".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_image_max_ticks() -> u32 {
    90
}

fn default_enhance_max_ticks() -> u32 {
    60
}

fn default_video_max_ticks() -> u32 {
    150
}

fn default_max_poll_errors() -> u32 {
    3
}

fn default_jobs_dir() -> String {
    "jobs".to_string()
}

fn default_retention_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_enhance() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replicate_api_token: String::new(),
            openai_key: String::new(),
            provider: default_provider(),
            image_model: default_image_model(),
            enhance_model: default_enhance_model(),
            video_model: default_video_model(),
            vision_model: default_vision_model(),
            planner_model: default_planner_model(),
            poll_interval_ms: default_poll_interval_ms(),
            image_max_ticks: default_image_max_ticks(),
            enhance_max_ticks: default_enhance_max_ticks(),
            video_max_ticks: default_video_max_ticks(),
            max_poll_errors: default_max_poll_errors(),
            jobs_dir: default_jobs_dir(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            enhance: default_enhance(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content).context("config.json is not valid")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("config.json: poll_interval_ms must be positive");
        }
        if self.is_mock() {
            return Ok(());
        }
        if self.provider != "replicate" {
            anyhow::bail!("config.json: unknown provider '{}'", self.provider);
        }
        if self.replicate_api_token.is_empty() {
            anyhow::bail!("config.json: replicate_api_token missing");
        }
        if self.openai_key.is_empty() {
            anyhow::bail!("config.json: open_api_key missing");
        }
        Ok(())
    }

    pub fn is_mock(&self) -> bool {
        self.provider == MOCK_PROVIDER
    }

    pub fn poll_policy(&self, stage: Stage) -> PollPolicy {
        let max_ticks = match stage {
            Stage::Image => self.image_max_ticks,
            Stage::Enhance => self.enhance_max_ticks,
            Stage::Video => self.video_max_ticks,
        };
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_ticks,
            max_poll_errors: self.max_poll_errors,
        }
    }

    pub fn chain_settings(&self) -> ChainSettings {
        let target = |model: &str| ModelTarget::new(self.provider.clone(), model);
        ChainSettings {
            image: target(&self.image_model),
            video: target(&self.video_model),
            enhancer: self.enhance.then(|| target(&self.enhance_model)),
            image_policy: self.poll_policy(Stage::Image),
            enhance_policy: self.poll_policy(Stage::Enhance),
            video_policy: self.poll_policy(Stage::Video),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
