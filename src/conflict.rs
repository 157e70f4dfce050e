//! Hook-vs-body conflict detection and constrained regeneration.
//!
//! A body segment whose solution item is `bringing` requires the item to be
//! visible in at least one resolved hook frame, because such items are
//! staged into the opening scene for continuity. `interacting` items are
//! not checked. A conflict is resolved by asking the planner for a new
//! storyboard that excludes the item and, when the hook frames allow it,
//! only uses items actually visible there.

use crate::error::GenerationError;
use crate::storyboard::{Segment, SolutionAction, Storyboard};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum VisionAnswer {
    Flag(bool),
    Structured(Value),
}

/// Vision-capable yes/no or structured question answering over an image.
#[async_trait]
pub trait VisionCheck: Send + Sync {
    async fn classify(&self, image_uri: &str, question: &str)
    -> Result<VisionAnswer, GenerationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub item: String,
    pub action: SolutionAction,
    pub has_conflict: bool,
    /// Frames examined (empty when no check was needed).
    pub frames: Vec<String>,
    /// Subset of `frames` where the item was seen.
    #[serde(default)]
    pub visible_in: Vec<String>,
}

pub fn presence_question(item: &str) -> String {
    format!(
        "Is there a {item} clearly visible anywhere in this image? Answer with only yes or no."
    )
}

pub const ITEMS_QUESTION: &str = "List every distinct physical object clearly visible in this \
image. Respond with JSON only: {\"items\": [\"object\", ...]} using short lowercase nouns.";

pub struct ConflictDetector<'a> {
    vision: &'a dyn VisionCheck,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(vision: &'a dyn VisionCheck) -> Self {
        Self { vision }
    }

    pub async fn check(
        &self,
        body: &Segment,
        hook_frames: &[String],
    ) -> Result<ConflictReport, GenerationError> {
        let solution = body.solution.as_ref().ok_or_else(|| {
            GenerationError::InvalidStoryboard("segment has no solution item".to_string())
        })?;

        if solution.action == SolutionAction::Interacting {
            return Ok(ConflictReport {
                item: solution.name.clone(),
                action: solution.action,
                has_conflict: false,
                frames: Vec::new(),
                visible_in: Vec::new(),
            });
        }

        let question = presence_question(&solution.name);
        let answers = join_all(
            hook_frames
                .iter()
                .map(|frame| self.vision.classify(frame, &question)),
        )
        .await;

        let mut visible_in = Vec::new();
        for (frame, answer) in hook_frames.iter().zip(answers) {
            if answer_is_yes(&answer?) {
                visible_in.push(frame.clone());
            }
        }

        let has_conflict = visible_in.is_empty();
        tracing::info!(
            item = %solution.name,
            frames = hook_frames.len(),
            seen = visible_in.len(),
            has_conflict,
            "conflict check"
        );
        Ok(ConflictReport {
            item: solution.name.clone(),
            action: solution.action,
            has_conflict,
            frames: hook_frames.to_vec(),
            visible_in,
        })
    }

    /// Items visible in any of the frames, deduplicated case-insensitively.
    pub async fn visible_items(&self, frames: &[String]) -> Result<Vec<String>, GenerationError> {
        let answers = join_all(
            frames
                .iter()
                .map(|frame| self.vision.classify(frame, ITEMS_QUESTION)),
        )
        .await;

        let mut items: Vec<String> = Vec::new();
        for answer in answers {
            for item in answer_items(&answer?) {
                let item = item.trim().to_lowercase();
                if !item.is_empty() && !items.contains(&item) {
                    items.push(item);
                }
            }
        }
        Ok(items)
    }
}

fn answer_is_yes(answer: &VisionAnswer) -> bool {
    match answer {
        VisionAnswer::Flag(flag) => *flag,
        VisionAnswer::Structured(value) => ["present", "visible", "answer"]
            .iter()
            .filter_map(|key| value.get(*key))
            .any(|v| v.as_bool() == Some(true) || v.as_str().is_some_and(is_yes_text)),
    }
}

fn is_yes_text(text: &str) -> bool {
    text.trim().to_ascii_lowercase().starts_with("yes")
}

fn answer_items(answer: &VisionAnswer) -> Vec<String> {
    let list = match answer {
        VisionAnswer::Flag(_) => return Vec::new(),
        VisionAnswer::Structured(Value::Array(items)) => items,
        VisionAnswer::Structured(value) => match value.get("items").and_then(Value::as_array) {
            Some(items) => items,
            None => return Vec::new(),
        },
    };
    list.iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Inputs to a storyboard (re)plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub brief: String,
    pub aspect_ratio: String,
    pub segment_count: usize,
    /// Items the new solution must not use.
    #[serde(default)]
    pub excluded_items: Vec<String>,
    /// When non-empty, the solution may only use these items.
    #[serde(default)]
    pub allowed_items: Vec<String>,
    /// The storyboard being replaced, for context.
    #[serde(default)]
    pub previous: Option<Storyboard>,
}

#[async_trait]
pub trait StoryboardPlanner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<Storyboard, GenerationError>;
}

pub struct Regenerator<'a> {
    planner: &'a dyn StoryboardPlanner,
    detector: ConflictDetector<'a>,
}

impl<'a> Regenerator<'a> {
    pub fn new(planner: &'a dyn StoryboardPlanner, vision: &'a dyn VisionCheck) -> Self {
        Self {
            planner,
            detector: ConflictDetector::new(vision),
        }
    }

    /// Plan a new storyboard that avoids `item`. The input storyboard is
    /// left untouched.
    pub async fn regenerate_excluding(
        &self,
        storyboard: &Storyboard,
        item: &str,
        hook_frames: &[String],
    ) -> Result<Storyboard, GenerationError> {
        let mut allowed_items = if hook_frames.is_empty() {
            Vec::new()
        } else {
            match self.detector.visible_items(hook_frames).await {
                Ok(items) => items,
                Err(err) => {
                    tracing::warn!(error = %err, "could not list hook items, regenerating without allow-list");
                    Vec::new()
                }
            }
        };
        allowed_items.retain(|allowed| !allowed.eq_ignore_ascii_case(item));

        let request = PlanRequest {
            brief: storyboard.brief.clone(),
            aspect_ratio: storyboard.aspect_ratio.clone(),
            segment_count: storyboard.segments.len(),
            excluded_items: vec![item.to_string()],
            allowed_items,
            previous: Some(storyboard.clone()),
        };

        let mut fresh = self.planner.plan(&request).await?;
        fresh.validate()?;
        if fresh
            .segments
            .iter()
            .filter_map(|s| s.solution.as_ref())
            .any(|s| s.name.eq_ignore_ascii_case(item))
        {
            return Err(GenerationError::Planner(format!(
                "new storyboard still uses excluded item '{item}'"
            )));
        }
        if fresh.id == storyboard.id {
            fresh.id = uuid::Uuid::new_v4().to_string();
        }
        tracing::info!(
            excluded = item,
            allowed = request.allowed_items.len(),
            storyboard_id = %fresh.id,
            "storyboard regenerated"
        );
        Ok(fresh)
    }
}
