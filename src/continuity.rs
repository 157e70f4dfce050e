//! Segment continuity chain.
//!
//! Keyframe prompts are built strictly in storyboard order: segment *i*'s
//! first frame is conditioned on segment *i-1*'s resolved last frame, both as
//! a reference image and as "Transitioning from" text. The CTA is never
//! anchored. Within a segment the two keyframes are dispatched together, and
//! once every keyframe is known the video clips of all segments run
//! concurrently.

use crate::enhance::{AssetSource, EnhancementAttempt, EnhancementChain};
use crate::error::GenerationError;
use crate::poller::{PollPolicy, PredictionPoller};
use crate::prompt::{FramePosition, PromptComposer};
use crate::provider::{GenerationRequest, ModelTarget, ProviderGateway};
use crate::storyboard::{GenerationContext, Segment, SegmentKind, SegmentStatus, Storyboard};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub const TRANSITION_PREFIX: &str = "Transitioning from:";

pub const HERO_SHOT_INSTRUCTION: &str = "Closing hero shot with its own distinct composition: \
the product centered and cleanly lit, not a continuation of the previous scene.";

/// Models and poll budgets for every stage of the chain.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub image: ModelTarget,
    pub video: ModelTarget,
    pub enhancer: Option<ModelTarget>,
    pub image_policy: PollPolicy,
    pub enhance_policy: PollPolicy,
    pub video_policy: PollPolicy,
}

/// A resolved frame from the previous segment, copied by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityAnchor {
    pub uri: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFrame {
    pub prediction_id: String,
    #[serde(default)]
    pub enhancement_id: Option<String>,
    pub uri: String,
    pub source: AssetSource,
    pub prompt: String,
    pub references: Vec<String>,
}

impl ResolvedFrame {
    fn from_attempt(attempt: EnhancementAttempt, request: &GenerationRequest) -> Self {
        Self {
            prediction_id: attempt.base.id,
            enhancement_id: attempt.enhancement.map(|h| h.id),
            uri: attempt.resolved_uri,
            source: attempt.source,
            prompt: request.prompt.clone(),
            references: request.references.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyframePair {
    pub first: ResolvedFrame,
    pub last: ResolvedFrame,
}

impl KeyframePair {
    /// `Enhanced` only when both frames came out of the enhancement stage.
    pub fn source(&self) -> AssetSource {
        if self.first.source == AssetSource::Enhanced && self.last.source == AssetSource::Enhanced {
            AssetSource::Enhanced
        } else {
            AssetSource::Base
        }
    }

    pub fn uris(&self) -> Vec<String> {
        vec![self.first.uri.clone(), self.last.uri.clone()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVideo {
    pub prediction_id: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentOutput {
    pub index: usize,
    pub kind: SegmentKind,
    pub status: SegmentStatus,
    #[serde(default)]
    pub keyframes: Option<KeyframePair>,
    #[serde(default)]
    pub video: Option<ResolvedVideo>,
    #[serde(default)]
    pub source: Option<AssetSource>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SegmentOutput {
    pub fn pending(index: usize, kind: SegmentKind) -> Self {
        Self {
            index,
            kind,
            status: SegmentStatus::Pending,
            keyframes: None,
            video: None,
            source: None,
            error: None,
        }
    }

    fn fail(&mut self, err: &GenerationError) {
        self.status = SegmentStatus::Failed;
        self.error = Some(err.to_string());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Full,
    /// Only the hook's two keyframes.
    Preview,
}

/// Receives the segment outputs after every change, for checkpointing.
#[async_trait]
pub trait ChainObserver: Send + Sync {
    async fn on_progress(&self, outputs: &[SegmentOutput]);
}

pub struct NoopObserver;

#[async_trait]
impl ChainObserver for NoopObserver {
    async fn on_progress(&self, _outputs: &[SegmentOutput]) {}
}

#[derive(Debug)]
pub struct ChainFailure {
    pub segment: usize,
    pub error: GenerationError,
    pub outputs: Vec<SegmentOutput>,
}

pub fn anchor_after(segment: &Segment, pair: &KeyframePair) -> ContinuityAnchor {
    ContinuityAnchor {
        uri: pair.last.uri.clone(),
        description: segment.continuity_text().to_string(),
    }
}

pub struct ContinuityChain<'a> {
    gateway: &'a ProviderGateway,
    composer: &'a dyn PromptComposer,
    settings: &'a ChainSettings,
}

impl<'a> ContinuityChain<'a> {
    pub fn new(
        gateway: &'a ProviderGateway,
        composer: &'a dyn PromptComposer,
        settings: &'a ChainSettings,
    ) -> Self {
        Self {
            gateway,
            composer,
            settings,
        }
    }

    /// Finalise both keyframe requests for a segment.
    pub fn keyframe_requests(
        &self,
        segment: &Segment,
        anchor: Option<&ContinuityAnchor>,
        ctx: &GenerationContext,
    ) -> (GenerationRequest, GenerationRequest) {
        let anchor = if segment.kind == SegmentKind::Cta {
            None
        } else {
            anchor
        };

        let mut first_prompt = self
            .composer
            .keyframe_prompt(segment, FramePosition::First, ctx);
        let mut last_prompt = self
            .composer
            .keyframe_prompt(segment, FramePosition::Last, ctx);

        if segment.kind == SegmentKind::Cta {
            first_prompt = format!("{first_prompt}\n\n{HERO_SHOT_INSTRUCTION}");
            last_prompt = format!("{last_prompt}\n\n{HERO_SHOT_INSTRUCTION}");
        } else if let Some(anchor) = anchor {
            first_prompt = format!("{first_prompt}\n\n{TRANSITION_PREFIX} {}", anchor.description);
        }

        let first = self.frame_request(
            segment,
            FramePosition::First,
            first_prompt,
            references(anchor, ctx, segment.first_frame.as_deref()),
            ctx,
        );
        let last = self.frame_request(
            segment,
            FramePosition::Last,
            last_prompt,
            references(anchor, ctx, segment.last_frame.as_deref()),
            ctx,
        );
        (first, last)
    }

    fn frame_request(
        &self,
        segment: &Segment,
        position: FramePosition,
        prompt: String,
        references: Vec<String>,
        ctx: &GenerationContext,
    ) -> GenerationRequest {
        let frame = match position {
            FramePosition::First => "first",
            FramePosition::Last => "last",
        };
        GenerationRequest::new(&self.settings.image, prompt)
            .with_references(references)
            .with_aspect_ratio(ctx.aspect_ratio.clone())
            .with_option("segment_type", segment.kind.to_string())
            .with_option("frame", frame)
    }

    fn enhancement_chain(&self, ctx: &GenerationContext) -> EnhancementChain<'_> {
        let enhancer = if ctx.enhance {
            self.settings.enhancer.as_ref()
        } else {
            None
        };
        EnhancementChain::new(
            self.gateway,
            self.settings.image_policy,
            self.settings.enhance_policy,
            enhancer,
        )
    }

    pub async fn generate_keyframes(
        &self,
        segment: &Segment,
        anchor: Option<&ContinuityAnchor>,
        ctx: &GenerationContext,
        cancel: &CancellationToken,
    ) -> Result<KeyframePair, GenerationError> {
        let (first_request, last_request) = self.keyframe_requests(segment, anchor, ctx);
        let chain = self.enhancement_chain(ctx);

        let (first, last) = futures::join!(
            chain.run(&first_request, cancel),
            chain.run(&last_request, cancel)
        );
        Ok(KeyframePair {
            first: ResolvedFrame::from_attempt(first?, &first_request),
            last: ResolvedFrame::from_attempt(last?, &last_request),
        })
    }

    pub fn video_request(
        &self,
        segment: &Segment,
        pair: &KeyframePair,
        ctx: &GenerationContext,
    ) -> GenerationRequest {
        GenerationRequest::new(&self.settings.video, self.composer.video_prompt(segment, ctx))
            .with_references(pair.uris())
            .with_aspect_ratio(ctx.aspect_ratio.clone())
            .with_option("duration", segment.duration_secs().ceil() as u64)
            .with_option("segment_type", segment.kind.to_string())
    }

    pub async fn generate_video(
        &self,
        segment: &Segment,
        pair: &KeyframePair,
        ctx: &GenerationContext,
        cancel: &CancellationToken,
    ) -> Result<ResolvedVideo, GenerationError> {
        let request = self.video_request(segment, pair, ctx);
        let mut handle = self.gateway.submit(&request).await?;
        let uri = PredictionPoller::new(self.gateway, self.settings.video_policy)
            .drive(&mut handle, cancel)
            .await?;
        Ok(ResolvedVideo {
            prediction_id: handle.id,
            uri,
        })
    }

    /// Run keyframes for every segment in order, then the video clips
    /// concurrently. Preview mode stops after the hook's keyframes.
    pub async fn run(
        &self,
        storyboard: &Storyboard,
        ctx: &GenerationContext,
        mode: RunMode,
        generate_video: bool,
        observer: &dyn ChainObserver,
        cancel: &CancellationToken,
    ) -> Result<Vec<SegmentOutput>, ChainFailure> {
        if let Err(error) = storyboard.validate() {
            return Err(ChainFailure {
                segment: 0,
                error,
                outputs: Vec::new(),
            });
        }

        let segments = match mode {
            RunMode::Full => &storyboard.segments[..],
            RunMode::Preview => &storyboard.segments[..1],
        };
        let with_video = generate_video && mode == RunMode::Full;
        let mut outputs: Vec<SegmentOutput> = segments
            .iter()
            .enumerate()
            .map(|(i, s)| SegmentOutput::pending(i, s.kind))
            .collect();

        let mut anchor: Option<ContinuityAnchor> = None;
        for (index, segment) in segments.iter().enumerate() {
            outputs[index].status = SegmentStatus::Generating;
            observer.on_progress(&outputs).await;

            let pair = match self
                .generate_keyframes(segment, anchor.as_ref(), ctx, cancel)
                .await
            {
                Ok(pair) => pair,
                Err(error) => {
                    tracing::warn!(segment = index, kind = %segment.kind, error = %error, "keyframes failed");
                    outputs[index].fail(&error);
                    observer.on_progress(&outputs).await;
                    return Err(ChainFailure {
                        segment: index,
                        error,
                        outputs,
                    });
                }
            };

            tracing::info!(
                segment = index,
                kind = %segment.kind,
                source = ?pair.source(),
                "keyframes resolved"
            );
            anchor = Some(anchor_after(segment, &pair));
            outputs[index].source = Some(pair.source());
            outputs[index].keyframes = Some(pair);
            if !with_video {
                outputs[index].status = SegmentStatus::Completed;
            }
            observer.on_progress(&outputs).await;
        }

        if !with_video {
            return Ok(outputs);
        }

        let clips = join_all(segments.iter().zip(outputs.iter()).map(|(segment, output)| {
            let pair = output.keyframes.clone();
            async move {
                match pair {
                    Some(pair) => self.generate_video(segment, &pair, ctx, cancel).await,
                    None => Err(GenerationError::Internal(
                        "segment has no keyframes".to_string(),
                    )),
                }
            }
        }))
        .await;

        let mut first_failure: Option<(usize, GenerationError)> = None;
        for (index, clip) in clips.into_iter().enumerate() {
            match clip {
                Ok(video) => {
                    outputs[index].video = Some(video);
                    outputs[index].status = SegmentStatus::Completed;
                }
                Err(error) => {
                    tracing::warn!(segment = index, error = %error, "video clip failed");
                    outputs[index].fail(&error);
                    if first_failure.is_none() {
                        first_failure = Some((index, error));
                    }
                }
            }
        }
        observer.on_progress(&outputs).await;

        match first_failure {
            Some((segment, error)) => Err(ChainFailure {
                segment,
                error,
                outputs,
            }),
            None => Ok(outputs),
        }
    }
}

fn references(
    anchor: Option<&ContinuityAnchor>,
    ctx: &GenerationContext,
    preset: Option<&str>,
) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    let candidates = anchor
        .map(|a| a.uri.as_str())
        .into_iter()
        .chain(ctx.reference_images.iter().map(String::as_str))
        .chain(preset);
    for uri in candidates {
        if !uri.is_empty() && !refs.iter().any(|r| r == uri) {
            refs.push(uri.to_string());
        }
    }
    refs
}
