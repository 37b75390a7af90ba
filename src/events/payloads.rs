//! Typed payloads for the event catalog.
//!
//! Each event type has a payload struct serialized into the event's JSON
//! `data` column. Readers should tolerate missing optional fields: the
//! payloads are an export format, not an internal API.

use serde::{Deserialize, Serialize};

use crate::traits::Mood;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartedData {
    pub space_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndedData {
    pub reason: SessionEndReason,
    pub duration_minutes: i64,
    pub message_count: i64,
    /// Token accounting for the session, when the provider reported any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    /// The user explicitly closed the session.
    UserEnded,
    /// The idle sweeper ended it after the inactivity timeout.
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicIntroducedData {
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRevisitedData {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_comprehension: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensionUpdatedData {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_level: Option<u8>,
    pub new_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizAttemptedData {
    pub topic: String,
    /// Questions answered correctly.
    pub correct: i64,
    /// Questions attempted.
    pub attempts: i64,
}

/// Shared payload for the boundary-flag events (frustration, struggle,
/// breakthrough, practice-requested).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundarySignalData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub details: String,
    pub mood: Mood,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJobData {
    /// Job name, e.g. "extraction".
    pub job: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
