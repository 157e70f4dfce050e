//! Scripted in-process provider for tests and dry runs.
//!
//! No network calls. Each submitted request is matched against the rules in
//! order and the first match decides how its prediction behaves; results are
//! `mock://` URIs emitted in rotating output shapes (plain string, array,
//! object) so the gateway's normalisation is exercised too.

use super::{GenerationProvider, GenerationRequest, RawPrediction};
use crate::error::GenerationError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Report `processing` for `after_polls` polls, then succeed.
    Succeed { after_polls: u32 },
    /// Report `succeeded` with an empty output.
    SucceedWithoutOutput { after_polls: u32 },
    Fail { after_polls: u32, reason: String },
    Cancel { after_polls: u32 },
    /// Never leaves `processing`.
    Hang,
    /// Refuse the submission outright.
    Reject { reason: String },
    /// Accept the submission, then fail every status call at the transport level.
    Unreachable,
}

type Matcher = Box<dyn Fn(&GenerationRequest) -> bool + Send + Sync>;

struct MockRule {
    matcher: Matcher,
    behavior: MockBehavior,
}

struct MockPrediction {
    behavior: MockBehavior,
    polls: u32,
    uri: String,
    shape: u64,
}

pub struct MockProvider {
    name: String,
    models: Vec<String>,
    rules: Vec<MockRule>,
    default_behavior: MockBehavior,
    predictions: Mutex<HashMap<String, MockPrediction>>,
    submitted: Mutex<Vec<GenerationRequest>>,
    counter: AtomicU64,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            models: Vec::new(),
            rules: Vec::new(),
            default_behavior: MockBehavior::Succeed { after_polls: 1 },
            predictions: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Restrict the accepted models. An empty list accepts any model.
    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_default(mut self, behavior: MockBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub fn with_rule<F>(mut self, matcher: F, behavior: MockBehavior) -> Self
    where
        F: Fn(&GenerationRequest) -> bool + Send + Sync + 'static,
    {
        self.rules.push(MockRule {
            matcher: Box::new(matcher),
            behavior,
        });
        self
    }

    /// Every request accepted so far, in submission order.
    pub fn submitted(&self) -> Vec<GenerationRequest> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn behavior_for(&self, request: &GenerationRequest) -> MockBehavior {
        self.rules
            .iter()
            .find(|rule| (rule.matcher)(request))
            .map(|rule| rule.behavior.clone())
            .unwrap_or_else(|| self.default_behavior.clone())
    }

    fn output_value(uri: &str, shape: u64) -> Value {
        match shape % 3 {
            0 => json!(uri),
            1 => json!([uri]),
            _ => json!({ "url": uri }),
        }
    }
}

#[async_trait]
impl GenerationProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let behavior = self.behavior_for(request);
        if let MockBehavior::Reject { reason } = &behavior {
            return Err(GenerationError::Rejected {
                provider: self.name.clone(),
                reason: reason.clone(),
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}", self.name, n);
        let uri = format!("mock://{}/{}/{}", self.name, request.model, id);

        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        self.predictions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id.clone(),
                MockPrediction {
                    behavior,
                    polls: 0,
                    uri,
                    shape: n,
                },
            );
        Ok(id)
    }

    async fn status(&self, prediction_id: &str) -> Result<RawPrediction, GenerationError> {
        let mut predictions = self.predictions.lock().unwrap_or_else(|e| e.into_inner());
        let prediction = predictions.get_mut(prediction_id).ok_or_else(|| {
            GenerationError::Transport {
                provider: self.name.clone(),
                reason: format!("unknown prediction {prediction_id}"),
            }
        })?;
        prediction.polls += 1;
        let polls = prediction.polls;

        let processing = RawPrediction {
            status: Some("processing".to_string()),
            ..RawPrediction::default()
        };

        let raw = match &prediction.behavior {
            MockBehavior::Succeed { after_polls } if polls > *after_polls => RawPrediction {
                status: Some("succeeded".to_string()),
                output: Self::output_value(&prediction.uri, prediction.shape),
                error: Value::Null,
            },
            MockBehavior::SucceedWithoutOutput { after_polls } if polls > *after_polls => {
                RawPrediction {
                    status: Some("succeeded".to_string()),
                    output: Value::Null,
                    error: Value::Null,
                }
            }
            MockBehavior::Fail {
                after_polls,
                reason,
            } if polls > *after_polls => RawPrediction {
                status: Some("failed".to_string()),
                output: Value::Null,
                error: json!(reason),
            },
            MockBehavior::Cancel { after_polls } if polls > *after_polls => RawPrediction {
                status: Some("canceled".to_string()),
                ..RawPrediction::default()
            },
            MockBehavior::Unreachable => {
                return Err(GenerationError::Transport {
                    provider: self.name.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            _ => processing,
        };
        Ok(raw)
    }
}
