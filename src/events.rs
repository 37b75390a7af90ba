//! Append-only learning-event log.
//!
//! Every lifecycle, behavioral, and background-job signal the engine
//! produces is captured as an immutable event row for external analytics.
//! The core never mutates or deletes an event. Emission from the turn
//! loop is fail-open (a lost observability event must not fail a turn);
//! events derived by the extraction job are written inside its apply
//! transaction so they land exactly when the delta does.

mod payloads;
mod store;

pub use payloads::*;
pub use store::EventStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single immutable event in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub id: i64,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub event_type: EventType,
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl LearningEvent {
    /// Create a new event (id is assigned by the database).
    pub fn new(user_id: impl Into<String>, event_type: EventType, data: JsonValue) -> Self {
        Self {
            id: 0,
            user_id: user_id.into(),
            space_id: None,
            conversation_id: None,
            event_type,
            data,
            created_at: Utc::now(),
        }
    }

    pub fn in_space(mut self, space_id: impl Into<String>) -> Self {
        self.space_id = Some(space_id.into());
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Parse the event data into a typed payload.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// The event catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // === Session lifecycle ===
    SessionStarted,
    SessionEnded,

    // === Topic signals (derived by extraction) ===
    TopicIntroduced,
    TopicRevisited,
    ComprehensionUpdated,

    // === Assessment ===
    QuizAttempted,

    // === Boundary flags (conservative, false-biased) ===
    FrustrationDetected,
    StruggleDetected,
    BreakthroughMoment,
    PracticeRequested,

    // === Background jobs ===
    BackgroundJobStarted,
    BackgroundJobCompleted,
    BackgroundJobFailed,
}

impl EventType {
    /// String form used in database storage and analytics exports.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStarted => "session_started",
            EventType::SessionEnded => "session_ended",
            EventType::TopicIntroduced => "topic_introduced",
            EventType::TopicRevisited => "topic_revisited",
            EventType::ComprehensionUpdated => "comprehension_updated",
            EventType::QuizAttempted => "quiz_attempted",
            EventType::FrustrationDetected => "frustration_detected",
            EventType::StruggleDetected => "struggle_detected",
            EventType::BreakthroughMoment => "breakthrough_moment",
            EventType::PracticeRequested => "practice_requested",
            EventType::BackgroundJobStarted => "background_job_started",
            EventType::BackgroundJobCompleted => "background_job_completed",
            EventType::BackgroundJobFailed => "background_job_failed",
        }
    }

    /// Parse from the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session_started" => Some(EventType::SessionStarted),
            "session_ended" => Some(EventType::SessionEnded),
            "topic_introduced" => Some(EventType::TopicIntroduced),
            "topic_revisited" => Some(EventType::TopicRevisited),
            "comprehension_updated" => Some(EventType::ComprehensionUpdated),
            "quiz_attempted" => Some(EventType::QuizAttempted),
            "frustration_detected" => Some(EventType::FrustrationDetected),
            "struggle_detected" => Some(EventType::StruggleDetected),
            "breakthrough_moment" => Some(EventType::BreakthroughMoment),
            "practice_requested" => Some(EventType::PracticeRequested),
            "background_job_started" => Some(EventType::BackgroundJobStarted),
            "background_job_completed" => Some(EventType::BackgroundJobCompleted),
            "background_job_failed" => Some(EventType::BackgroundJobFailed),
            _ => None,
        }
    }

    pub const ALL: &'static [EventType] = &[
        EventType::SessionStarted,
        EventType::SessionEnded,
        EventType::TopicIntroduced,
        EventType::TopicRevisited,
        EventType::ComprehensionUpdated,
        EventType::QuizAttempted,
        EventType::FrustrationDetected,
        EventType::StruggleDetected,
        EventType::BreakthroughMoment,
        EventType::PracticeRequested,
        EventType::BackgroundJobStarted,
        EventType::BackgroundJobCompleted,
        EventType::BackgroundJobFailed,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_storage_form() {
        for event_type in EventType::ALL {
            assert_eq!(EventType::parse(event_type.as_str()), Some(*event_type));
        }
        assert_eq!(EventType::parse("nonsense"), None);
    }

    #[test]
    fn builder_attaches_references() {
        let event = LearningEvent::new("u1", EventType::SessionStarted, serde_json::json!({}))
            .in_space("s1")
            .in_conversation("c1");
        assert_eq!(event.space_id.as_deref(), Some("s1"));
        assert_eq!(event.conversation_id.as_deref(), Some("c1"));
    }
}
