use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

pub mod api;
pub mod config;
pub mod conflict;
pub mod continuity;
pub mod enhance;
pub mod error;
pub mod init;
pub mod job_store;
pub mod orchestrator;
pub mod poller;
pub mod prompt;
pub mod provider;
pub mod storyboard;

pub use config::Config;
pub use error::{ErrorKind, GenerationError, StoreError};
pub use job_store::{GenerationJob, JobStatus, JobStore};
pub use orchestrator::{JobSpec, Orchestrator};
pub use provider::{GenerationProvider, GenerationRequest, PredictionHandle, ProviderGateway};

pub type GeneratorLogHook = Arc<Mutex<dyn Fn(&str) + Send + Sync + 'static>>;

static LOG_HOOK: Lazy<Mutex<Option<GeneratorLogHook>>> = Lazy::new(|| Mutex::new(None));

/// Mirror progress lines to an embedding UI (the CLI prints them).
pub fn set_log_hook(hook: Option<GeneratorLogHook>) {
    if let Ok(mut guard) = LOG_HOOK.lock() {
        *guard = hook;
    }
}

fn forward_to_hook(tag: &str, message: &str) {
    if let Ok(guard) = LOG_HOOK.lock() {
        if let Some(hook) = guard.as_ref() {
            if let Ok(callback) = hook.lock() {
                let line = format!("[{}] {}", tag, message);
                callback(&line);
            }
        }
    }
}

pub(crate) fn logi(message: impl AsRef<str>) {
    tracing::info!("{}", message.as_ref());
    forward_to_hook("INFO", message.as_ref());
}

pub(crate) fn logok(message: impl AsRef<str>) {
    tracing::info!(outcome = "ok", "{}", message.as_ref());
    forward_to_hook("OK", message.as_ref());
}

pub(crate) fn logw(message: impl AsRef<str>) {
    tracing::warn!("{}", message.as_ref());
    forward_to_hook("WARN", message.as_ref());
}
