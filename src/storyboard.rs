use crate::error::GenerationError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Hook,
    Body,
    Cta,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Hook => write!(f, "hook"),
            SegmentKind::Body => write!(f, "body"),
            SegmentKind::Cta => write!(f, "cta"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    #[default]
    Pending,
    Generating,
    Completed,
    Failed,
}

/// How a body segment's solution item relates to the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolutionAction {
    /// Introduces the item; it is staged into the hook ahead of time.
    Bringing,
    /// Operates on an item that already exists in the scene.
    Interacting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionItem {
    pub name: String,
    pub action: SolutionAction,
}

/// One narrative beat of a storyboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start_secs: f32,
    pub end_secs: f32,
    pub prompt: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    /// Visual summary used as "transitioning from" context by the next segment.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub first_frame: Option<String>,
    #[serde(default)]
    pub last_frame: Option<String>,
    #[serde(default)]
    pub solution: Option<SolutionItem>,
}

impl Segment {
    pub fn new(kind: SegmentKind, start_secs: f32, end_secs: f32, prompt: &str) -> Self {
        Self {
            kind,
            start_secs,
            end_secs,
            prompt: prompt.to_string(),
            alternatives: Vec::new(),
            description: None,
            first_frame: None,
            last_frame: None,
            solution: None,
        }
    }

    pub fn with_solution(mut self, name: &str, action: SolutionAction) -> Self {
        self.solution = Some(SolutionItem {
            name: name.to_string(),
            action,
        });
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn duration_secs(&self) -> f32 {
        (self.end_secs - self.start_secs).max(0.0)
    }

    /// Text the next segment uses to describe where it transitions from.
    pub fn continuity_text(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.prompt)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storyboard {
    #[serde(default = "new_storyboard_id")]
    pub id: String,
    #[serde(default)]
    pub brief: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    pub segments: Vec<Segment>,
}

fn new_storyboard_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_aspect_ratio() -> String {
    "9:16".to_string()
}

impl Storyboard {
    pub fn new(brief: &str, segments: Vec<Segment>) -> Self {
        Self {
            id: new_storyboard_id(),
            brief: brief.to_string(),
            aspect_ratio: default_aspect_ratio(),
            segments,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, GenerationError> {
        let storyboard: Storyboard = serde_json::from_str(text)
            .map_err(|e| GenerationError::InvalidStoryboard(format!("parse failed: {e}")))?;
        storyboard.validate()?;
        Ok(storyboard)
    }

    /// Ordering rules: starts with the hook, at most one CTA and only last,
    /// non-negative time ranges that never run backwards.
    pub fn validate(&self) -> Result<(), GenerationError> {
        let invalid = |msg: String| Err(GenerationError::InvalidStoryboard(msg));

        let Some(first) = self.segments.first() else {
            return invalid("storyboard has no segments".to_string());
        };
        if first.kind != SegmentKind::Hook {
            return invalid(format!("first segment must be a hook, found {}", first.kind));
        }

        let last_index = self.segments.len() - 1;
        let mut previous_end = 0.0f32;
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 && segment.kind == SegmentKind::Hook {
                return invalid(format!("segment {index} is a second hook"));
            }
            if segment.kind == SegmentKind::Cta && index != last_index {
                return invalid(format!("cta segment {index} is not the last segment"));
            }
            if segment.start_secs < 0.0 || segment.end_secs < segment.start_secs {
                return invalid(format!(
                    "segment {index} has an invalid time range {}..{}",
                    segment.start_secs, segment.end_secs
                ));
            }
            if segment.start_secs < previous_end {
                return invalid(format!("segment {index} starts before the previous one ends"));
            }
            if segment.prompt.trim().is_empty() {
                return invalid(format!("segment {index} has an empty prompt"));
            }
            previous_end = segment.end_secs;
        }
        Ok(())
    }

    pub fn bodies(&self) -> impl Iterator<Item = (usize, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == SegmentKind::Body)
    }
}

/// Per-run inputs shared by every segment of a storyboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    /// Product/character images every keyframe is conditioned on.
    #[serde(default)]
    pub reference_images: Vec<String>,
    #[serde(default = "default_true")]
    pub enhance: bool,
}

fn default_true() -> bool {
    true
}

impl Default for GenerationContext {
    fn default() -> Self {
        Self {
            aspect_ratio: default_aspect_ratio(),
            reference_images: Vec::new(),
            enhance: true,
        }
    }
}
