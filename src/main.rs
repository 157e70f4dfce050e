use ai_ad_shorts::api::{OpenAiPlanner, OpenAiVision, ReplicateProvider};
use ai_ad_shorts::config::{Config, MOCK_PROVIDER};
use ai_ad_shorts::continuity::RunMode;
use ai_ad_shorts::job_store::FsDurableStore;
use ai_ad_shorts::provider::MockProvider;
use ai_ad_shorts::storyboard::{GenerationContext, Storyboard};
use ai_ad_shorts::{init, set_log_hook, JobSpec, JobStatus, JobStore, Orchestrator, ProviderGateway};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "ai-ad-shorts", version, about = "Storyboard to keyframes and clips for short video ads")]
struct Cli {
    /// Path to config.json
    #[arg(long, default_value = "config.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a storyboard and wait for it to finish
    Run {
        storyboard: PathBuf,
        /// Only the hook's keyframes
        #[arg(long)]
        preview: bool,
        /// Skip the video clip stage
        #[arg(long)]
        no_video: bool,
        /// Check solution items against the hook and plan an alternative
        #[arg(long)]
        resolve_conflicts: bool,
        /// Use the in-process mock provider
        #[arg(long)]
        mock: bool,
    },
    /// Print a job's status from the jobs directory
    Status { job_id: String },
}

async fn load_config(path: &Path, mock: bool) -> Result<Config> {
    if !mock {
        return Config::load(path).await;
    }
    let mut config = if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content).context("config.json is not valid")?
    } else {
        Config::default()
    };
    config.provider = MOCK_PROVIDER.to_string();
    config.poll_interval_ms = config.poll_interval_ms.min(50);
    Ok(config)
}

fn job_store(config: &Config) -> Arc<JobStore> {
    Arc::new(JobStore::with_retention(
        Arc::new(FsDurableStore::new(&config.jobs_dir)),
        config.retention(),
    ))
}

fn build_orchestrator(config: &Config, store: Arc<JobStore>) -> Orchestrator {
    let client = reqwest::Client::new();
    let gateway = if config.is_mock() {
        ProviderGateway::new().with_provider(Arc::new(MockProvider::new(MOCK_PROVIDER)))
    } else {
        ProviderGateway::new().with_provider(Arc::new(ReplicateProvider::new(
            client.clone(),
            config.replicate_api_token.clone(),
        )))
    };
    let vision = OpenAiVision::new(client.clone(), config.openai_key.clone(), config.vision_model.clone());
    let planner = OpenAiPlanner::new(client, config.openai_key.clone(), config.planner_model.clone());
    Orchestrator::new(
        Arc::new(gateway),
        store,
        Arc::new(vision),
        Arc::new(planner),
        config.chain_settings(),
    )
}

async fn run(config: Config, storyboard_path: &Path, mode: RunMode, generate_video: bool, resolve_conflicts: bool) -> Result<i32> {
    let text = tokio::fs::read_to_string(storyboard_path)
        .await
        .with_context(|| format!("Failed to read storyboard: {}", storyboard_path.display()))?;
    let storyboard = Storyboard::from_json(&text)?;
    if resolve_conflicts && config.openai_key.is_empty() {
        anyhow::bail!("--resolve-conflicts needs open_api_key in config.json");
    }

    let store = job_store(&config);
    let sweeper_stop = CancellationToken::new();
    let sweeper = store.spawn_sweeper(config.sweep_interval(), sweeper_stop.clone());
    let orchestrator = build_orchestrator(&config, Arc::clone(&store));

    let context = GenerationContext {
        aspect_ratio: storyboard.aspect_ratio.clone(),
        enhance: config.enhance,
        ..GenerationContext::default()
    };
    let job_id = orchestrator
        .submit_job(JobSpec::Storyboard {
            storyboard,
            context,
            mode,
            generate_video,
            resolve_conflicts,
        })
        .await?;
    println!("[INFO] Job id: {}", job_id);

    let mut last_status = JobStatus::Pending;
    let view = loop {
        tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
        let view = orchestrator.get_job_status(&job_id).await?;
        if view.status != last_status {
            println!("[INFO] Job {} is {:?}", job_id, view.status);
            last_status = view.status;
        }
        if view.status.is_terminal() {
            break view;
        }
    };

    sweeper_stop.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "job sweeper ended abnormally");
    }

    if let Some(result) = &view.result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    let usage = orchestrator.usage();
    println!(
        "[INFO] Predictions: {} submitted, {} failed, {} enhanced, {} base fallbacks",
        usage.submitted, usage.failed, usage.enhanced, usage.base_fallbacks
    );
    match view.status {
        JobStatus::Completed => Ok(0),
        _ => {
            eprintln!("[ERROR] {}", view.error.unwrap_or_else(|| "job failed".to_string()));
            Ok(1)
        }
    }
}

async fn status(config: Config, job_id: &str) -> Result<i32> {
    let store = job_store(&config);
    match store.get(job_id).await? {
        Some(job) => {
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(0)
        }
        None => {
            eprintln!("[ERROR] Job {} not found in {}", job_id, config.jobs_dir);
            Ok(1)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let hook: ai_ad_shorts::GeneratorLogHook = Arc::new(Mutex::new(|line: &str| println!("{}", line)));
    set_log_hook(Some(hook));

    let code = match cli.command {
        Command::Run {
            storyboard,
            preview,
            no_video,
            resolve_conflicts,
            mock,
        } => {
            let config = load_config(&cli.config, mock).await?;
            init::ensure_directories(&config).await?;
            let mode = if preview { RunMode::Preview } else { RunMode::Full };
            run(config, &storyboard, mode, !no_video, resolve_conflicts).await?
        }
        Command::Status { job_id } => {
            let config = load_config(&cli.config, true).await?;
            status(config, &job_id).await?
        }
    };
    std::process::exit(code);
}
