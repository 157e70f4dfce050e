//! Prompt composition seam. The orchestration core treats these strings as
//! opaque; only the continuity chain appends its own context to them.

use crate::storyboard::{GenerationContext, Segment, SegmentKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePosition {
    First,
    Last,
}

pub trait PromptComposer: Send + Sync {
    fn keyframe_prompt(
        &self,
        segment: &Segment,
        position: FramePosition,
        ctx: &GenerationContext,
    ) -> String;

    fn video_prompt(&self, segment: &Segment, ctx: &GenerationContext) -> String;
}

/// Default composer: the segment prompt plus framing hints.
#[derive(Debug, Default, Clone)]
pub struct TemplateComposer;

impl PromptComposer for TemplateComposer {
    fn keyframe_prompt(
        &self,
        segment: &Segment,
        position: FramePosition,
        ctx: &GenerationContext,
    ) -> String {
        let moment = match position {
            FramePosition::First => "Opening frame of the shot",
            FramePosition::Last => "Closing frame of the shot",
        };
        let beat = match segment.kind {
            SegmentKind::Hook => "attention-grabbing hook",
            SegmentKind::Body => "story beat",
            SegmentKind::Cta => "call to action",
        };
        format!(
            "{moment} ({beat}). {}\nPhotorealistic advertising still, aspect ratio {}.",
            segment.prompt.trim(),
            ctx.aspect_ratio
        )
    }

    fn video_prompt(&self, segment: &Segment, _ctx: &GenerationContext) -> String {
        format!(
            "{} Smooth motion from the first frame to the last frame over {:.1} seconds.",
            segment.prompt.trim(),
            segment.duration_secs()
        )
    }
}
