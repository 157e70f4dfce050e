use crate::error::GenerationError;
use crate::provider::{GenerationProvider, GenerationRequest, RawPrediction};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::time::Duration;

pub const REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";

const PROVIDER_NAME: &str = "replicate";
const REQUEST_TIMEOUT_S: u64 = 60;

/// Request options used for routing and tracing only, never sent upstream.
const LOCAL_OPTION_KEYS: &[&str] = &["segment_type", "frame", "stage"];

/// Replicate predictions API.
///
/// Models are addressed as `owner/name`, or `owner/name:version` to pin a
/// specific version.
pub struct ReplicateProvider {
    client: Client,
    token: String,
    base_url: String,
    models: Vec<String>,
}

impl ReplicateProvider {
    pub fn new(client: Client, token: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
            base_url: REPLICATE_API_BASE.to_string(),
            models: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Restrict the provider to these models. Without a list any
    /// `owner/name` model id is accepted.
    pub fn with_models(mut self, models: &[String]) -> Self {
        self.models = models.to_vec();
        self
    }

    fn transport(err: impl std::fmt::Display) -> GenerationError {
        GenerationError::Transport {
            provider: PROVIDER_NAME.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Build the `input` object of a prediction request. Provider options are
/// merged last and may override the defaults.
pub fn build_input(request: &GenerationRequest) -> Value {
    let mut input = Map::new();
    input.insert("prompt".to_string(), json!(request.prompt));
    if let Some(aspect_ratio) = &request.aspect_ratio {
        input.insert("aspect_ratio".to_string(), json!(aspect_ratio));
    }
    if let Some(width) = request.width {
        input.insert("width".to_string(), json!(width));
    }
    if let Some(height) = request.height {
        input.insert("height".to_string(), json!(height));
    }
    if let Some(first) = request.references.first() {
        input.insert("image".to_string(), json!(first));
        input.insert("image_input".to_string(), json!(request.references));
    }
    if let Some(last) = request.references.get(1) {
        input.insert("last_image".to_string(), json!(last));
    }
    for (key, value) in &request.options {
        if !LOCAL_OPTION_KEYS.contains(&key.as_str()) {
            input.insert(key.clone(), value.clone());
        }
    }
    Value::Object(input)
}

fn error_text(raw: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(raw).ok();
    let detail = parsed.as_ref().and_then(|v| {
        v.get("detail")
            .or_else(|| v.get("error"))
            .or_else(|| v.get("title"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    detail.unwrap_or_else(|| raw.chars().take(400).collect())
}

#[async_trait]
impl GenerationProvider for ReplicateProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn supports_model(&self, model: &str) -> bool {
        if self.models.is_empty() {
            let name = model.split(':').next().unwrap_or("");
            let mut parts = name.split('/');
            matches!((parts.next(), parts.next(), parts.next()), (Some(o), Some(n), None) if !o.is_empty() && !n.is_empty())
        } else {
            self.models.iter().any(|m| m == model)
        }
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let input = build_input(request);
        let (url, body) = match request.model.split_once(':') {
            Some((_, version)) => (
                format!("{}/predictions", self.base_url),
                json!({ "version": version, "input": input }),
            ),
            None => (
                format!("{}/models/{}/predictions", self.base_url, request.model),
                json!({ "input": input }),
            ),
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
            .send()
            .await
            .map_err(Self::transport)?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            tracing::warn!(model = %request.model, http = status.as_u16(), "replicate refused prediction");
            return Err(GenerationError::Rejected {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("HTTP {}: {}", status.as_u16(), error_text(&raw)),
            });
        }

        let root: Value = serde_json::from_str(&raw).map_err(Self::transport)?;
        root.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GenerationError::Rejected {
                provider: PROVIDER_NAME.to_string(),
                reason: "response carried no prediction id".to_string(),
            })
    }

    async fn status(&self, prediction_id: &str) -> Result<RawPrediction, GenerationError> {
        let url = format!("{}/predictions/{}", self.base_url, prediction_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
            .send()
            .await
            .map_err(Self::transport)?;

        let status = resp.status();
        let raw = resp.text().await.map_err(Self::transport)?;
        if !status.is_success() {
            return Err(Self::transport(format!(
                "HTTP {} polling {}: {}",
                status.as_u16(),
                prediction_id,
                error_text(&raw)
            )));
        }

        let root: Value = serde_json::from_str(&raw).map_err(Self::transport)?;
        Ok(RawPrediction {
            status: root.get("status").and_then(Value::as_str).map(str::to_string),
            output: root.get("output").cloned().unwrap_or(Value::Null),
            error: root.get("error").cloned().unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ModelTarget;

    #[test]
    fn input_carries_prompt_refs_and_options() {
        let request = GenerationRequest::new(&ModelTarget::new("replicate", "acme/img"), "a red kettle")
            .with_aspect_ratio("9:16")
            .with_references(vec!["https://a/first.png".into(), "https://a/last.png".into()])
            .with_option("duration", 5)
            .with_option("segment_type", "body");
        let input = build_input(&request);
        assert_eq!(input["prompt"], "a red kettle");
        assert_eq!(input["aspect_ratio"], "9:16");
        assert_eq!(input["image"], "https://a/first.png");
        assert_eq!(input["last_image"], "https://a/last.png");
        assert_eq!(input["image_input"].as_array().map(Vec::len), Some(2));
        assert_eq!(input["duration"], 5);
        assert!(input.get("segment_type").is_none());
    }

    #[test]
    fn options_override_defaults() {
        let request = GenerationRequest::new(&ModelTarget::new("replicate", "acme/img"), "p")
            .with_aspect_ratio("9:16")
            .with_option("aspect_ratio", "1:1");
        assert_eq!(build_input(&request)["aspect_ratio"], "1:1");
        assert!(build_input(&request).get("image").is_none());
    }

    #[test]
    fn model_ids_need_owner_and_name() {
        let provider = ReplicateProvider::new(Client::new(), "t");
        assert!(provider.supports_model("black-forest-labs/flux-schnell"));
        assert!(provider.supports_model("acme/img:abc123"));
        assert!(!provider.supports_model("flux"));
        assert!(!provider.supports_model("a/b/c"));

        let pinned = provider.with_models(&["acme/img".to_string()]);
        assert!(!pinned.supports_model("acme/other"));
    }

    #[test]
    fn error_text_prefers_detail() {
        assert_eq!(error_text(r#"{"detail":"Invalid version"}"#), "Invalid version");
        assert_eq!(error_text("gateway timeout"), "gateway timeout");
    }
}
