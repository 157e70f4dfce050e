use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`GenerationError`], persisted on failed jobs
/// so callers can tell "never started" from "started then failed" and
/// "the provider said no" from "we gave up waiting".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Submission,
    ProviderFailure,
    Timeout,
    Canceled,
    Abandoned,
    Collaborator,
    Internal,
}

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("model '{model}' is not served by provider '{provider}'")]
    UnknownModel { provider: String, model: String },

    #[error("generation request has an empty prompt")]
    EmptyPrompt,

    #[error("{provider} rejected the request: {reason}")]
    Rejected { provider: String, reason: String },

    #[error("transport error talking to {provider}: {reason}")]
    Transport { provider: String, reason: String },

    #[error("prediction {id} failed: {reason}")]
    ProviderFailed { id: String, reason: String },

    #[error("prediction {id} was canceled by the provider")]
    Canceled { id: String },

    #[error("prediction {id} reported success without a usable result")]
    SucceededWithoutResult { id: String },

    #[error("lost contact with prediction {id}: {reason}")]
    PollLost { id: String, reason: String },

    #[error("prediction {id} timed out after {ticks} polls")]
    TimedOut { id: String, ticks: u32 },

    #[error("stopped waiting for prediction {id}")]
    Abandoned { id: String },

    #[error("vision check failed: {0}")]
    Vision(String),

    #[error("storyboard planner failed: {0}")]
    Planner(String),

    #[error("invalid storyboard: {0}")]
    InvalidStoryboard(String),

    #[error("job store error: {0}")]
    Store(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownProvider(_)
            | Self::UnknownModel { .. }
            | Self::EmptyPrompt
            | Self::Rejected { .. }
            | Self::Transport { .. } => ErrorKind::Submission,
            Self::ProviderFailed { .. }
            | Self::SucceededWithoutResult { .. }
            | Self::PollLost { .. } => ErrorKind::ProviderFailure,
            Self::TimedOut { .. } => ErrorKind::Timeout,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::Abandoned { .. } => ErrorKind::Abandoned,
            Self::Vision(_) | Self::Planner(_) | Self::InvalidStoryboard(_) => {
                ErrorKind::Collaborator
            }
            Self::Store(_) | Self::JobNotFound(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when no remote prediction was ever created for the request.
    pub fn never_started(&self) -> bool {
        self.kind() == ErrorKind::Submission
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for GenerationError {
    fn from(err: StoreError) -> Self {
        GenerationError::Store(err.to_string())
    }
}
