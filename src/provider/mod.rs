//! Provider gateway: the uniform submit/poll interface over every external
//! generation provider.
//!
//! Providers return their raw prediction payloads; [`ProviderGateway::poll`]
//! normalises every response shape into a [`PredictionSnapshot`] exactly once
//! so nothing downstream has to sniff output shapes.

pub mod mock;

use crate::error::GenerationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use mock::{MockBehavior, MockProvider};

/// Immutable description of one unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    /// Image or video URIs the provider should condition on.
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Provider-specific inputs, merged last into the provider payload.
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl GenerationRequest {
    pub fn new(target: &ModelTarget, prompt: impl Into<String>) -> Self {
        Self {
            provider: target.provider.clone(),
            model: target.model.clone(),
            prompt: prompt.into(),
            references: Vec::new(),
            aspect_ratio: None,
            width: None,
            height: None,
            options: Map::new(),
        }
    }

    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(aspect_ratio.into());
        self
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

/// A provider/model pair a pipeline stage sends its requests to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Local view of a prediction's lifecycle.
///
/// Transitions only move forward: `Submitted -> Running -> terminal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PredictionStatus {
    Submitted,
    Running,
    Succeeded { uri: String },
    Failed { reason: String },
    /// The local tick budget ran out; the remote job may still finish.
    TimedOut { ticks: u32 },
    Canceled,
}

impl PredictionStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Running => 1,
            Self::Succeeded { .. }
            | Self::Failed { .. }
            | Self::TimedOut { .. }
            | Self::Canceled => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// Identifier plus local status for one submitted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionHandle {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub status: PredictionStatus,
    pub submitted_at: DateTime<Utc>,
    /// Poll ticks spent on this handle so far.
    #[serde(default)]
    pub ticks: u32,
}

impl PredictionHandle {
    pub fn new(id: impl Into<String>, provider: &str, model: &str) -> Self {
        Self {
            id: id.into(),
            provider: provider.to_string(),
            model: model.to_string(),
            status: PredictionStatus::Submitted,
            submitted_at: Utc::now(),
            ticks: 0,
        }
    }

    /// Apply `next` if it moves the handle forward. Returns whether the
    /// status changed; a terminal handle never changes again.
    pub fn advance(&mut self, next: PredictionStatus) -> bool {
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return false;
        }
        tracing::debug!(
            prediction_id = %self.id,
            from = ?self.status,
            to = ?next,
            "prediction transition"
        );
        self.status = next;
        true
    }

    pub fn result_uri(&self) -> Option<&str> {
        match &self.status {
            PredictionStatus::Succeeded { uri } => Some(uri),
            _ => None,
        }
    }
}

/// Whatever a provider's status endpoint returned, before normalisation.
#[derive(Debug, Clone, Default)]
pub struct RawPrediction {
    pub status: Option<String>,
    pub output: Value,
    pub error: Value,
}

/// Normalised remote state as reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionSnapshot {
    pub state: RemoteState,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Provider name used for routing (e.g. "replicate", "mock").
    fn name(&self) -> &str;

    fn supports_model(&self, model: &str) -> bool;

    /// Start a prediction. Returns the provider's prediction id.
    async fn submit(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    /// Fetch the raw status payload for a prediction.
    async fn status(&self, prediction_id: &str) -> Result<RawPrediction, GenerationError>;
}

/// Simple usage counters; the only billing concern of the pipeline.
#[derive(Debug, Default)]
pub struct UsageCounters {
    submitted: AtomicU64,
    failed: AtomicU64,
    enhanced: AtomicU64,
    base_fallbacks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub submitted: u64,
    pub failed: u64,
    pub enhanced: u64,
    pub base_fallbacks: u64,
}

impl UsageCounters {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enhanced(&self) {
        self.enhanced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_base_fallback(&self) {
        self.base_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            enhanced: self.enhanced.load(Ordering::Relaxed),
            base_fallbacks: self.base_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Registry of providers keyed by name. Performs no retries.
#[derive(Default)]
pub struct ProviderGateway {
    providers: HashMap<String, Arc<dyn GenerationProvider>>,
    usage: UsageCounters,
}

impl ProviderGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn GenerationProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn GenerationProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn usage(&self) -> &UsageCounters {
        &self.usage
    }

    fn provider(&self, name: &str) -> Result<&Arc<dyn GenerationProvider>, GenerationError> {
        self.providers
            .get(name)
            .ok_or_else(|| GenerationError::UnknownProvider(name.to_string()))
    }

    /// Validate and submit a request. An `Err` here means no remote
    /// prediction exists.
    pub async fn submit(
        &self,
        request: &GenerationRequest,
    ) -> Result<PredictionHandle, GenerationError> {
        let provider = self.provider(&request.provider)?;
        if !provider.supports_model(&request.model) {
            return Err(GenerationError::UnknownModel {
                provider: request.provider.clone(),
                model: request.model.clone(),
            });
        }
        if request.prompt.trim().is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }

        let id = provider.submit(request).await?;
        self.usage.record_submitted();
        tracing::info!(
            provider = %request.provider,
            model = %request.model,
            prediction_id = %id,
            references = request.references.len(),
            "prediction submitted"
        );
        Ok(PredictionHandle::new(id, &request.provider, &request.model))
    }

    pub async fn poll(
        &self,
        handle: &PredictionHandle,
    ) -> Result<PredictionSnapshot, GenerationError> {
        let provider = self.provider(&handle.provider)?;
        let raw = provider.status(&handle.id).await?;
        Ok(normalize_prediction(&raw))
    }
}

pub fn normalize_prediction(raw: &RawPrediction) -> PredictionSnapshot {
    PredictionSnapshot {
        state: parse_remote_state(raw.status.as_deref()),
        output: normalize_output(&raw.output),
        error: normalize_error(&raw.error),
    }
}

pub fn parse_remote_state(status: Option<&str>) -> RemoteState {
    let Some(status) = status else {
        return RemoteState::Running;
    };
    match status.trim().to_ascii_lowercase().as_str() {
        "starting" | "queued" | "pending" | "submitted" => RemoteState::Queued,
        "succeeded" | "completed" | "complete" | "done" | "success" => RemoteState::Succeeded,
        "failed" | "error" => RemoteState::Failed,
        "canceled" | "cancelled" => RemoteState::Canceled,
        _ => RemoteState::Running,
    }
}

const OUTPUT_KEYS: &[&str] = &["url", "uri", "image", "video", "output"];

/// Reduce a provider output (string, array, or object) to one result URI.
pub fn normalize_output(output: &Value) -> Option<String> {
    match output {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Array(items) => items.iter().find_map(normalize_output),
        Value::Object(map) => OUTPUT_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(normalize_output),
        _ => None,
    }
}

fn normalize_error(error: &Value) -> Option<String> {
    match error {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .or_else(|| Some(error.to_string())),
        other => Some(other.to_string()),
    }
}
