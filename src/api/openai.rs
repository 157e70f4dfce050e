use crate::conflict::{PlanRequest, StoryboardPlanner, VisionAnswer, VisionCheck};
use crate::error::GenerationError;
use crate::storyboard::Storyboard;
use crate::{logi, logw};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

pub const OPENAI_RESPONSES_URL: &str = "https://api.openai.com/v1/responses";

const MAX_BRIEF_CHARS: usize = 8_000;
const MAX_PREVIOUS_CHARS: usize = 40_000;
const VISION_TIMEOUT_S: u64 = 120;
const PLANNER_TIMEOUT_S: u64 = 600;

static FENCED_JSON: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").ok());

fn sanitize_utf8_lossy(input: &str) -> String {
    String::from_utf8_lossy(input.as_bytes()).into_owned()
}

fn trim_copy_utf8_safe(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }

    let mut cut = max_bytes.min(input.len());
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    input[..cut].to_string()
}

fn openai_extract_output_text(resp_json: &str) -> Option<String> {
    let root: Value = serde_json::from_str(resp_json).ok()?;

    if let Some(err) = root.get("error").filter(|e| !e.is_null()) {
        if let Some(msg) = err.get("message").and_then(|v| v.as_str()) {
            logw(format!("OpenAI error message: {}", msg));
        }
        if let Some(code) = err.get("code").and_then(|v| v.as_str()) {
            logw(format!("OpenAI error code: {}", code));
        }
        return None;
    }

    let output = root.get("output")?.as_array()?;
    for item in output {
        let Some(content) = item.get("content").and_then(|v| v.as_array()) else {
            continue;
        };
        for entry in content {
            if entry.get("type").and_then(|v| v.as_str()) == Some("output_text") {
                if let Some(text) = entry.get("text").and_then(|v| v.as_str()) {
                    return Some(text.to_string());
                }
            }
        }
    }

    None
}

/// Interpret a model reply as JSON when it is (or contains fenced) JSON,
/// otherwise as a yes/no flag.
pub fn parse_vision_reply(text: &str) -> Option<VisionAnswer> {
    let trimmed = text.trim();
    let candidate = FENCED_JSON
        .as_ref()
        .and_then(|re| re.captures(trimmed))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Some(match value {
            Value::Bool(flag) => VisionAnswer::Flag(flag),
            other => VisionAnswer::Structured(other),
        });
    }

    let word: String = trimmed
        .chars()
        .take_while(|c| c.is_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    match word.as_str() {
        "yes" | "true" => Some(VisionAnswer::Flag(true)),
        "no" | "false" => Some(VisionAnswer::Flag(false)),
        _ => None,
    }
}

async fn post_responses(
    client: &Client,
    api_key: &str,
    body: &Value,
    timeout_s: u64,
) -> Result<String, String> {
    let resp = client
        .post(OPENAI_RESPONSES_URL)
        .bearer_auth(api_key)
        .json(body)
        .timeout(Duration::from_secs(timeout_s))
        .send()
        .await
        .map_err(|e| format!("OpenAI request failed: {e}"))?;

    let status = resp.status();
    let raw = resp.text().await.unwrap_or_default();

    if !status.is_success() {
        logw(format!("OpenAI HTTP {}", status.as_u16()));
        let snippet = raw.chars().take(800).collect::<String>();
        if !snippet.is_empty() {
            logw(format!("OpenAI raw body: {}", snippet));
        }
        return Err(format!("HTTP {}", status.as_u16()));
    }

    openai_extract_output_text(&raw).ok_or_else(|| {
        let snippet = raw.chars().take(800).collect::<String>();
        logw(format!("OpenAI response parse failed. Raw body: {}", snippet));
        "response carried no output text".to_string()
    })
}

/// Vision checks through the Responses API with an `input_image` part.
pub struct OpenAiVision {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenAiVision {
    pub fn new(client: Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl VisionCheck for OpenAiVision {
    async fn classify(
        &self,
        image_uri: &str,
        question: &str,
    ) -> Result<VisionAnswer, GenerationError> {
        let body = json!({
            "model": self.model,
            "input": [{
                "role": "user",
                "content": [
                    {"type": "input_text", "text": question},
                    {"type": "input_image", "image_url": image_uri},
                ],
            }],
        });

        let text = post_responses(&self.client, &self.api_key, &body, VISION_TIMEOUT_S)
            .await
            .map_err(GenerationError::Vision)?;
        let answer = parse_vision_reply(&text).ok_or_else(|| {
            GenerationError::Vision(format!(
                "unreadable answer: {}",
                text.chars().take(200).collect::<String>()
            ))
        })?;
        tracing::debug!(image = image_uri, answer = ?answer, "vision answer");
        Ok(answer)
    }
}

/// Storyboard planning through the Responses API in JSON mode.
pub struct OpenAiPlanner {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenAiPlanner {
    pub fn new(client: Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

pub fn planner_prompt(request: &PlanRequest) -> String {
    let brief = trim_copy_utf8_safe(&sanitize_utf8_lossy(&request.brief), MAX_BRIEF_CHARS);
    let previous = request
        .previous
        .as_ref()
        .and_then(|p| serde_json::to_string(&p.segments).ok())
        .map(|s| trim_copy_utf8_safe(&s, MAX_PREVIOUS_CHARS))
        .unwrap_or_default();

    let mut rules = String::new();
    if !request.excluded_items.is_empty() {
        rules.push_str(&format!(
            "- The solution must NOT use any of: {}.\n",
            request.excluded_items.join(", ")
        ));
    }
    if !request.allowed_items.is_empty() {
        rules.push_str(&format!(
            "- A solution item with action \"bringing\" must be one of the objects already visible in the opening scene: {}.\n",
            request.allowed_items.join(", ")
        ));
    }

    format!(
        "Plan a short vertical video ad.\nBrief:\n{brief}\n\nPREVIOUS STORYBOARD (may be empty):\n{previous}\n\nTASK:\n- Write exactly {count} segments: the first is the \"hook\", the last is the \"cta\", the rest are \"body\".\n- Time ranges in seconds, non-overlapping and increasing, starting at 0.\n- Every body segment that shows the product solving the problem names its solution item and whether the character is \"bringing\" it into the scene or \"interacting\" with something already there.\n{rules}- Return STRICT JSON with this shape ONLY:\n  {{\"segments\":[{{\"kind\":\"hook\",\"start_secs\":0,\"end_secs\":3,\"prompt\":\"...\",\"description\":\"...\",\"alternatives\":[\"...\"],\"solution\":{{\"name\":\"...\",\"action\":\"bringing\"}}}}]}}\n",
        count = request.segment_count.max(2),
    )
}

#[async_trait]
impl StoryboardPlanner for OpenAiPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Storyboard, GenerationError> {
        let body = json!({
            "model": self.model,
            "input": [
                {"role": "system", "content": "You are a helpful assistant designed to output JSON."},
                {"role": "user", "content": planner_prompt(request)},
            ],
            "text": {"format": {"type": "json_object"}},
        });

        let text = post_responses(&self.client, &self.api_key, &body, PLANNER_TIMEOUT_S)
            .await
            .map_err(GenerationError::Planner)?;
        let mut plan: Value = serde_json::from_str(&text)
            .map_err(|e| GenerationError::Planner(format!("plan is not JSON: {e}")))?;
        if let Some(obj) = plan.as_object_mut() {
            obj.entry("brief").or_insert_with(|| json!(request.brief));
            obj.insert("aspect_ratio".to_string(), json!(request.aspect_ratio));
        }
        let storyboard: Storyboard = serde_json::from_value(plan)
            .map_err(|e| GenerationError::Planner(format!("plan has wrong shape: {e}")))?;
        logi(format!(
            "OpenAI plan received: {} segments",
            storyboard.segments.len()
        ));
        Ok(storyboard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_output_text() {
        let raw = r#"{"output":[{"type":"reasoning"},{"content":[{"type":"output_text","text":"yes"}]}]}"#;
        assert_eq!(openai_extract_output_text(raw).as_deref(), Some("yes"));
        assert_eq!(
            openai_extract_output_text(r#"{"error":{"message":"bad key"}}"#),
            None
        );
    }

    #[test]
    fn reads_flags_and_json() {
        assert_eq!(parse_vision_reply("Yes."), Some(VisionAnswer::Flag(true)));
        assert_eq!(parse_vision_reply(" no"), Some(VisionAnswer::Flag(false)));
        assert_eq!(
            parse_vision_reply("```json\n{\"items\": [\"mug\"]}\n```"),
            Some(VisionAnswer::Structured(json!({"items": ["mug"]})))
        );
        assert_eq!(parse_vision_reply("maybe"), None);
    }

    #[test]
    fn utf8_trim_respects_boundaries() {
        assert_eq!(trim_copy_utf8_safe("héllo", 2), "h");
        assert_eq!(trim_copy_utf8_safe("abc", 10), "abc");
    }

    #[test]
    fn prompt_lists_constraints() {
        let prompt = planner_prompt(&PlanRequest {
            brief: "rain jacket".into(),
            aspect_ratio: "9:16".into(),
            segment_count: 3,
            excluded_items: vec!["umbrella".into()],
            allowed_items: vec!["hood".into(), "bench".into()],
            previous: None,
        });
        assert!(prompt.contains("must NOT use any of: umbrella"));
        assert!(prompt.contains("hood, bench"));
        assert!(prompt.contains("exactly 3 segments"));
    }
}
