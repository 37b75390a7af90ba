//! Core domain records and the seams to external collaborators.
//!
//! Everything here is a plain serde struct stored in SQLite; the only
//! behavioral trait is [`CompletionProvider`], the black-box completion
//! capability the engine and the extraction job both consume.

mod provider;

pub use provider::{ChatTurn, CompletionProvider, CompletionText, ModelTier, TokenUsage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named learning context scoping one or more conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSpace {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

/// One bounded tutoring session; the unit of extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub space_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub extraction_status: ExtractionStatus,
}

/// Exactly-once claim for the extraction job, keyed by conversation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Running => "running",
            ExtractionStatus::Done => "done",
            ExtractionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExtractionStatus::Pending),
            "running" => Some(ExtractionStatus::Running),
            "done" => Some(ExtractionStatus::Done),
            "failed" => Some(ExtractionStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A message in a conversation. Append-only: after creation only the
/// attribute bag may change state, and only for quiz completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Insertion sequence; breaks creation-time ties and defines the total
    /// order of the transcript.
    pub seq: i64,
    pub role: Role,
    pub content: String,
    /// Open attribute bag. An assistant message carrying a checkpoint quiz
    /// stores it under the `quiz` key, parsed into a typed value exactly
    /// once at persistence time.
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// The typed quiz embedded in this message, if any.
    pub fn quiz(&self) -> Option<crate::quiz::Quiz> {
        let raw = self.metadata.get("quiz")?;
        serde_json::from_value(raw.clone()).ok()
    }
}

/// Per-topic learning signal aggregate, keyed by normalized topic name
/// within one user's profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicState {
    pub topic: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub sessions_count: i64,
    /// 1-5 ordinal comprehension estimate; unset until directly evidenced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comprehension: Option<u8>,
    /// Per-question correctness scores from checkpoint quizzes, in order.
    #[serde(default)]
    pub quiz_scores: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_quizzed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Mood classification for a session digest. Closed set; anything the
/// analysis can't place defaults to neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Engaged,
    Frustrated,
    Confused,
    Confident,
    #[default]
    Neutral,
}

/// Denormalized digest of one extracted session, kept on the profile as a
/// bounded most-recent-N window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDigest {
    pub conversation_id: String,
    pub occurred_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub synopsis: String,
    pub topics: Vec<String>,
    pub mood: Mood,
}

/// One learner profile per user. Learning state is mutated only by the
/// extraction job; goals, background, and preferences only by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerProfile {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goals: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default)]
    pub preferences: Value,
    /// Topic states ordered by `last_seen_at` descending.
    #[serde(default)]
    pub topics: Vec<TopicState>,
    /// Append-only learning-style observations, oldest first.
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_topic: Option<String>,
    /// The N most recent session digests, newest first.
    #[serde(default)]
    pub recent_sessions: Vec<SessionDigest>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_session_at: Option<DateTime<Utc>>,
}

impl LearnerProfile {
    /// First-session behavior: a profile that does not exist yet is
    /// synthesized empty rather than treated as an error.
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: None,
            goals: None,
            background: None,
            preferences: Value::Null,
            topics: Vec::new(),
            observations: Vec::new(),
            current_topic: None,
            recent_sessions: Vec::new(),
            open_questions: Vec::new(),
            last_session_at: None,
        }
    }

    /// Look up a topic by its normalized key.
    pub fn topic(&self, key: &str) -> Option<&TopicState> {
        self.topics.iter().find(|t| t.topic == key)
    }
}

/// A single graded assessment moment, denormalized for analytics. Holds
/// weak back-references only: deleting the parent space, conversation, or
/// message must not delete the attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizAttempt {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub topic: String,
    pub question: String,
    pub user_answer: String,
    pub is_correct: bool,
    pub attempt_number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}
