//! Two-tier generation: a base prediction followed by an optional
//! quality-enhancement pass over its output.
//!
//! The base stage has no fallback. The enhancement stage has its own poll
//! budget; when it fails, times out or is refused, the base result is used
//! and the attempt is tagged `source = base`.

use crate::error::GenerationError;
use crate::poller::{PollPolicy, PredictionPoller};
use crate::provider::{GenerationRequest, ModelTarget, PredictionHandle, ProviderGateway};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub const ENHANCE_INSTRUCTION: &str = "Enhance this image. Improve lighting, color balance, \
sharpness and clarity ONLY. Do NOT change product geometry, shape or proportions. Do NOT alter, \
add or remove any text, labels or logos. Do NOT change faces, identities, poses or expressions. \
Do NOT add or remove objects. Keep the composition and framing identical.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetSource {
    Base,
    Enhanced,
}

/// Base + optional enhancement prediction for one asset, with the URI the
/// pipeline should use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementAttempt {
    pub base: PredictionHandle,
    pub enhancement: Option<PredictionHandle>,
    pub resolved_uri: String,
    pub source: AssetSource,
}

pub struct EnhancementChain<'a> {
    gateway: &'a ProviderGateway,
    base_policy: PollPolicy,
    enhance_policy: PollPolicy,
    enhancer: Option<&'a ModelTarget>,
}

impl<'a> EnhancementChain<'a> {
    pub fn new(
        gateway: &'a ProviderGateway,
        base_policy: PollPolicy,
        enhance_policy: PollPolicy,
        enhancer: Option<&'a ModelTarget>,
    ) -> Self {
        Self {
            gateway,
            base_policy,
            enhance_policy,
            enhancer,
        }
    }

    pub async fn run(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<EnhancementAttempt, GenerationError> {
        let mut base = self.gateway.submit(request).await?;
        let base_uri = PredictionPoller::new(self.gateway, self.base_policy)
            .drive(&mut base, cancel)
            .await?;

        let Some(enhancer) = self.enhancer else {
            return Ok(EnhancementAttempt {
                base,
                enhancement: None,
                resolved_uri: base_uri,
                source: AssetSource::Base,
            });
        };

        let enhance_request = enhancement_request(enhancer, &base_uri, request);
        let mut enhancement = match self.gateway.submit(&enhance_request).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(base_id = %base.id, error = %err, "enhancement not started, using base");
                self.gateway.usage().record_base_fallback();
                return Ok(EnhancementAttempt {
                    base,
                    enhancement: None,
                    resolved_uri: base_uri,
                    source: AssetSource::Base,
                });
            }
        };

        let outcome = PredictionPoller::new(self.gateway, self.enhance_policy)
            .drive(&mut enhancement, cancel)
            .await;
        match outcome {
            Ok(uri) => {
                self.gateway.usage().record_enhanced();
                Ok(EnhancementAttempt {
                    base,
                    enhancement: Some(enhancement),
                    resolved_uri: uri,
                    source: AssetSource::Enhanced,
                })
            }
            Err(err @ GenerationError::Abandoned { .. }) => Err(err),
            Err(err) => {
                tracing::warn!(
                    base_id = %base.id,
                    enhancement_id = %enhancement.id,
                    error = %err,
                    "enhancement failed, falling back to base"
                );
                self.gateway.usage().record_base_fallback();
                Ok(EnhancementAttempt {
                    base,
                    enhancement: Some(enhancement),
                    resolved_uri: base_uri,
                    source: AssetSource::Base,
                })
            }
        }
    }
}

fn enhancement_request(
    enhancer: &ModelTarget,
    base_uri: &str,
    original: &GenerationRequest,
) -> GenerationRequest {
    let mut request = GenerationRequest::new(enhancer, ENHANCE_INSTRUCTION)
        .with_references(vec![base_uri.to_string()])
        .with_option("stage", "enhance");
    if let Some(aspect_ratio) = &original.aspect_ratio {
        request = request.with_aspect_ratio(aspect_ratio.clone());
    }
    for key in ["segment_type", "frame"] {
        if let Some(value) = original.options.get(key) {
            request = request.with_option(key, value.clone());
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockBehavior, MockProvider, PredictionStatus};
    use std::sync::Arc;
    use std::time::Duration;

    const FAST: PollPolicy = PollPolicy {
        interval: Duration::from_millis(5),
        max_ticks: 8,
        max_poll_errors: 2,
    };

    fn is_enhance(req: &GenerationRequest) -> bool {
        req.model == "enhancer"
    }

    fn setup(enhance: MockBehavior) -> (ProviderGateway, Arc<MockProvider>) {
        let mock = Arc::new(MockProvider::new("mock").with_rule(is_enhance, enhance));
        (ProviderGateway::new().with_provider(mock.clone()), mock)
    }

    fn base_request() -> GenerationRequest {
        GenerationRequest::new(&ModelTarget::new("mock", "flux"), "bottle on a rock")
            .with_aspect_ratio("9:16")
            .with_option("segment_type", "body")
    }

    #[tokio::test(start_paused = true)]
    async fn enhanced_result_wins() {
        let (gateway, mock) = setup(MockBehavior::Succeed { after_polls: 1 });
        let target = ModelTarget::new("mock", "enhancer");
        let attempt = EnhancementChain::new(&gateway, FAST, FAST, Some(&target))
            .run(&base_request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempt.source, AssetSource::Enhanced);
        let enhancement = attempt.enhancement.as_ref().unwrap();
        assert_eq!(enhancement.result_uri(), Some(attempt.resolved_uri.as_str()));

        let requests = mock.submitted();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].prompt, ENHANCE_INSTRUCTION);
        assert_eq!(requests[1].references, vec![attempt.base.result_uri().unwrap().to_string()]);
        assert_eq!(requests[1].aspect_ratio.as_deref(), Some("9:16"));
        assert_eq!(requests[1].options["segment_type"], "body");
        assert_eq!(gateway.usage().snapshot().enhanced, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enhancement_timeout_falls_back_to_base() {
        let (gateway, _) = setup(MockBehavior::Hang);
        let target = ModelTarget::new("mock", "enhancer");
        let attempt = EnhancementChain::new(&gateway, FAST, FAST, Some(&target))
            .run(&base_request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempt.source, AssetSource::Base);
        assert_eq!(Some(attempt.resolved_uri.as_str()), attempt.base.result_uri());
        assert!(matches!(
            attempt.enhancement.unwrap().status,
            PredictionStatus::TimedOut { .. }
        ));
        assert_eq!(gateway.usage().snapshot().base_fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_enhancement_falls_back_to_base() {
        let (gateway, _) = setup(MockBehavior::Reject {
            reason: "quota".into(),
        });
        let target = ModelTarget::new("mock", "enhancer");
        let attempt = EnhancementChain::new(&gateway, FAST, FAST, Some(&target))
            .run(&base_request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempt.source, AssetSource::Base);
        assert!(attempt.enhancement.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn base_failure_fails_the_attempt() {
        let mock = Arc::new(MockProvider::new("mock").with_default(MockBehavior::Fail {
            after_polls: 0,
            reason: "nsfw".into(),
        }));
        let gateway = ProviderGateway::new().with_provider(mock.clone());
        let target = ModelTarget::new("mock", "enhancer");
        let err = EnhancementChain::new(&gateway, FAST, FAST, Some(&target))
            .run(&base_request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::ProviderFailed { .. }));
        assert_eq!(mock.submitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_enhancer_means_base_source() {
        let (gateway, mock) = setup(MockBehavior::Hang);
        let attempt = EnhancementChain::new(&gateway, FAST, FAST, None)
            .run(&base_request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempt.source, AssetSource::Base);
        assert!(attempt.enhancement.is_none());
        assert_eq!(mock.submitted().len(), 1);
    }
}
