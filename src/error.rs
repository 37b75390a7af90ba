//! Error taxonomy for the engine's public surface.
//!
//! `Validation` and `Conflict` are caller mistakes and are never retried
//! internally. `Upstream` means the completion service failed after any
//! inbound data was already durable, so the caller may retry the turn
//! without losing anything. `ExtractionFailed` is terminal and only ever
//! reported through the event log.

use crate::providers::ProviderError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The record does not exist or is not owned by the requesting user.
    /// Ownership failures are deliberately indistinguishable from absence.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The request lost a race or targeted a terminal state: a second
    /// in-flight turn on the same conversation, a submission against an
    /// already-completed quiz, a turn on an ended conversation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed request: empty or oversized content, partial quiz
    /// submission, answers for unknown question ids.
    #[error("validation: {0}")]
    Validation(String),

    /// The completion service failed. The user message from this turn is
    /// already persisted; the caller may retry.
    #[error("completion service unavailable: {0}")]
    Upstream(#[from] ProviderError),

    /// Extraction exhausted its retries. The profile was left untouched.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("storage error: {0}")]
    Storage(anyhow::Error),
}

impl EngineError {
    /// True when retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Upstream(e) => e.is_transient(),
            EngineError::Storage(_) => false,
            _ => false,
        }
    }
}
