//! The extraction job: distill an ended conversation into the learner
//! profile, exactly once per conversation.
//!
//! Runs as independent background work spawned on `session_ended`; it
//! never shares a lock with the turn loop, so a user can start a new
//! conversation while a previous one is still being extracted. The
//! idempotency key is the conversation id, enforced by an atomic
//! `pending -> running` claim in the database: a duplicate trigger is a
//! no-op. The profile is updated in a single transaction or not at all —
//! a failed extraction leaves no partial merge behind.

pub mod analysis;
pub mod merge;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::EngineError;
use crate::events::{BackgroundJobData, EventStore, EventType, LearningEvent};
use crate::providers::{ProviderError, ProviderErrorKind};
use crate::quiz::QuizStatus;
use crate::state::SqliteStateStore;
use crate::traits::{
    ChatTurn, CompletionProvider, Conversation, LearnerProfile, Message, ModelTier, Role,
};

use analysis::{ANALYSIS_SYSTEM_PROMPT, SessionAnalysis, build_analysis_input, parse_analysis};
use merge::{ProfileDelta, SessionMeta, compute_delta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// This run claimed the conversation and applied a delta.
    Applied,
    /// Another run already handled (or is handling) this conversation.
    Skipped,
}

pub struct ExtractionJob {
    store: SqliteStateStore,
    events: EventStore,
    provider: Arc<dyn CompletionProvider>,
    config: Arc<AppConfig>,
}

impl ExtractionJob {
    pub fn new(
        store: SqliteStateStore,
        events: EventStore,
        provider: Arc<dyn CompletionProvider>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            events,
            provider,
            config,
        }
    }

    /// Run extraction for one ended conversation.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, conversation_id: &str) -> crate::Result<ExtractionOutcome> {
        if !self
            .store
            .claim_extraction(conversation_id)
            .await
            .map_err(internal)?
        {
            debug!(conversation_id, "extraction already recorded, skipping");
            return Ok(ExtractionOutcome::Skipped);
        }

        let started = Instant::now();
        let conversation = self
            .store
            .get_conversation_unchecked(conversation_id)
            .await
            .map_err(internal)?
            .ok_or(EngineError::NotFound("conversation"))?;

        self.events
            .emit(
                LearningEvent::new(
                    conversation.user_id.clone(),
                    EventType::BackgroundJobStarted,
                    json!(BackgroundJobData {
                        job: "extraction".to_string(),
                        duration_ms: None,
                        success: None,
                        error: None,
                    }),
                )
                .in_space(conversation.space_id.clone())
                .in_conversation(conversation.id.clone()),
            )
            .await;

        match self.extract(&conversation).await {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(conversation_id, duration_ms, "extraction applied");
                self.events
                    .emit(
                        LearningEvent::new(
                            conversation.user_id.clone(),
                            EventType::BackgroundJobCompleted,
                            json!(BackgroundJobData {
                                job: "extraction".to_string(),
                                duration_ms: Some(duration_ms),
                                success: Some(true),
                                error: None,
                            }),
                        )
                        .in_space(conversation.space_id.clone())
                        .in_conversation(conversation.id.clone()),
                    )
                    .await;
                Ok(ExtractionOutcome::Applied)
            }
            Err(error) => {
                warn!(conversation_id, %error, "extraction failed, profile left unchanged");
                if let Err(mark_error) = self.store.mark_extraction_failed(conversation_id).await {
                    warn!(conversation_id, %mark_error, "failed to record extraction failure");
                }
                self.events
                    .emit(
                        LearningEvent::new(
                            conversation.user_id.clone(),
                            EventType::BackgroundJobFailed,
                            json!(BackgroundJobData {
                                job: "extraction".to_string(),
                                duration_ms: Some(started.elapsed().as_millis() as u64),
                                success: Some(false),
                                error: Some(error.to_string()),
                            }),
                        )
                        .in_space(conversation.space_id.clone())
                        .in_conversation(conversation.id.clone()),
                    )
                    .await;
                Err(EngineError::ExtractionFailed(error.to_string()))
            }
        }
    }

    async fn extract(&self, conversation: &Conversation) -> anyhow::Result<()> {
        // Snapshot is read after the claim, so it can never be older than
        // the session_ended event that triggered this job.
        let transcript = self.store.full_transcript(&conversation.id).await?;
        let profile = self.store.get_profile(&conversation.user_id).await?;

        let ended_at = conversation.ended_at.unwrap_or(conversation.last_message_at);
        let meta = SessionMeta {
            conversation_id: conversation.id.clone(),
            space_id: conversation.space_id.clone(),
            user_id: conversation.user_id.clone(),
            ended_at,
            duration_minutes: (ended_at - conversation.started_at).num_minutes().max(0),
        };

        let analysis = self.analyze_with_retries(&profile, &transcript).await?;
        let quiz_scores = completed_quiz_scores(&transcript);
        let delta = compute_delta(&analysis, &profile, &meta, &quiz_scores);
        self.apply_delta(conversation, &delta).await
    }

    /// Call the fast-tier model, retrying transient failures (including
    /// malformed output) with exponential backoff. Non-transient failures
    /// (auth, billing) abort immediately.
    async fn analyze_with_retries(
        &self,
        profile: &LearnerProfile,
        transcript: &[Message],
    ) -> anyhow::Result<SessionAnalysis> {
        let input = build_analysis_input(profile, transcript);
        let turns = [ChatTurn::new(Role::User, input)];
        let model = self.config.provider.models.for_tier(ModelTier::Fast);
        let max_attempts = self.config.extraction.max_attempts.max(1);
        let base_delay = self.config.extraction.retry_base_delay_secs;

        let mut last_error = ProviderError::malformed("analysis never attempted");
        for attempt in 0..max_attempts {
            if attempt > 0 {
                let wait = base_delay * 2u64.pow(attempt - 1);
                debug!(
                    wait_secs = wait,
                    attempt = attempt + 1,
                    max = max_attempts,
                    "retrying session analysis"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }

            match self
                .provider
                .complete(model, ANALYSIS_SYSTEM_PROMPT, &turns, self.config.provider.max_tokens)
                .await
            {
                Ok(completion) => match parse_analysis(&completion.text) {
                    Ok(analysis) => return Ok(analysis),
                    Err(parse_error) => {
                        warn!(attempt = attempt + 1, %parse_error, "analysis output malformed");
                        last_error = parse_error;
                    }
                },
                Err(error) => {
                    let provider_error = match error.downcast::<ProviderError>() {
                        Ok(pe) => pe,
                        Err(other) => ProviderError {
                            kind: ProviderErrorKind::Unknown,
                            status: None,
                            message: other.to_string(),
                            retry_after_secs: None,
                        },
                    };
                    if !provider_error.is_transient() {
                        return Err(anyhow::Error::new(provider_error));
                    }
                    warn!(attempt = attempt + 1, %provider_error, "analysis call failed");
                    last_error = provider_error;
                }
            }
        }
        Err(anyhow::Error::new(last_error))
    }

    /// Apply the delta as one transaction: per-key topic merges, list
    /// appends, the bounded recent-session window, attempt rows, derived
    /// events, and the `done` stamp all land together.
    async fn apply_delta(
        &self,
        conversation: &Conversation,
        delta: &ProfileDelta,
    ) -> anyhow::Result<()> {
        let user_id = &conversation.user_id;
        let max_recent = self.config.extraction.max_recent_sessions as i64;
        let mut tx = self.store.pool().begin().await?;

        sqlx::query("INSERT OR IGNORE INTO profiles (user_id) VALUES (?)")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        for topic in &delta.topics {
            // Read-merge-write per key inside the transaction. Unrelated
            // keys from a concurrent extraction are untouched.
            let existing = sqlx::query_as::<_, (String, i64, Option<i64>, String, Option<String>, Option<String>)>(
                "SELECT first_seen_at, sessions_count, comprehension, quiz_scores, last_quizzed_at, notes
                 FROM topic_states WHERE user_id = ? AND topic = ?",
            )
            .bind(user_id)
            .bind(&topic.key)
            .fetch_optional(&mut *tx)
            .await?;

            let ended = delta.digest.occurred_at.to_rfc3339();
            let (first_seen, sessions_count, prior_level, mut scores, last_quizzed, notes) =
                match existing {
                    Some((first, count, level, scores_raw, quizzed, notes)) => (
                        first,
                        count + 1,
                        level,
                        serde_json::from_str::<Vec<f64>>(&scores_raw).unwrap_or_default(),
                        quizzed,
                        notes,
                    ),
                    None => (ended.clone(), 1, None, Vec::new(), None, None),
                };

            scores.extend_from_slice(&topic.quiz_scores);
            let last_quizzed = if topic.quiz_scores.is_empty() {
                last_quizzed
            } else {
                Some(ended.clone())
            };
            let comprehension = topic
                .comprehension
                .map(i64::from)
                .or(prior_level);
            let notes = match (&topic.regression_note, notes) {
                (Some(note), Some(existing_notes)) => {
                    Some(format!("{}\n{}", existing_notes, note))
                }
                (Some(note), None) => Some(note.clone()),
                (None, existing_notes) => existing_notes,
            };

            sqlx::query(
                "INSERT INTO topic_states
                   (user_id, topic, first_seen_at, last_seen_at, sessions_count, comprehension,
                    quiz_scores, last_quizzed_at, notes)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(user_id, topic) DO UPDATE SET
                   last_seen_at = excluded.last_seen_at,
                   sessions_count = excluded.sessions_count,
                   comprehension = excluded.comprehension,
                   quiz_scores = excluded.quiz_scores,
                   last_quizzed_at = excluded.last_quizzed_at,
                   notes = excluded.notes",
            )
            .bind(user_id)
            .bind(&topic.key)
            .bind(&first_seen)
            .bind(&ended)
            .bind(sessions_count)
            .bind(comprehension)
            .bind(serde_json::to_string(&scores)?)
            .bind(&last_quizzed)
            .bind(&notes)
            .execute(&mut *tx)
            .await?;
        }

        for observation in &delta.observations {
            sqlx::query(
                "INSERT OR IGNORE INTO style_observations (user_id, observation, created_at)
                 VALUES (?, ?, ?)",
            )
            .bind(user_id)
            .bind(observation)
            .bind(delta.digest.occurred_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        // Prepend the digest, then evict beyond the window. Lossy by
        // design; the event log keeps the full history.
        sqlx::query(
            "INSERT INTO recent_sessions
               (user_id, conversation_id, occurred_at, duration_minutes, synopsis, topics, mood)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&delta.digest.conversation_id)
        .bind(delta.digest.occurred_at.to_rfc3339())
        .bind(delta.digest.duration_minutes)
        .bind(&delta.digest.synopsis)
        .bind(serde_json::to_string(&delta.digest.topics)?)
        .bind(mood_str(delta.digest.mood))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM recent_sessions
             WHERE user_id = ? AND id NOT IN (
               SELECT id FROM recent_sessions WHERE user_id = ? ORDER BY id DESC LIMIT ?
             )",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(max_recent)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE profiles
             SET current_topic = ?, open_questions = ?, last_session_at = ?
             WHERE user_id = ?",
        )
        .bind(&delta.current_topic)
        .bind(serde_json::to_string(&delta.open_questions)?)
        .bind(delta.digest.occurred_at.to_rfc3339())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        for attempt in &delta.attempts {
            sqlx::query(
                "INSERT INTO quiz_attempts
                   (id, user_id, space_id, conversation_id, message_id, topic, question,
                    user_answer, is_correct, attempt_number, confidence, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&attempt.id)
            .bind(&attempt.user_id)
            .bind(&attempt.space_id)
            .bind(&attempt.conversation_id)
            .bind(&attempt.message_id)
            .bind(&attempt.topic)
            .bind(&attempt.question)
            .bind(&attempt.user_answer)
            .bind(attempt.is_correct as i64)
            .bind(attempt.attempt_number)
            .bind(attempt.confidence)
            .bind(attempt.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE conversations SET summary = ?, extraction_status = 'done'
             WHERE id = ? AND extraction_status = 'running'",
        )
        .bind(&delta.digest.synopsis)
        .bind(&conversation.id)
        .execute(&mut *tx)
        .await?;

        for event in &delta.events {
            EventStore::append_on(&mut *tx, event).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Per-question correctness scores of the session's completed checkpoint
/// quizzes, in transcript order. Computed from the stored quiz payloads,
/// not from the analysis — grading already happened at submission time.
pub fn completed_quiz_scores(transcript: &[Message]) -> Vec<f64> {
    let mut scores = Vec::new();
    for message in transcript {
        if let Some(quiz) = message.quiz() {
            if quiz.status == QuizStatus::Completed {
                scores.extend(quiz.scores());
            }
        }
    }
    scores
}

fn mood_str(mood: crate::traits::Mood) -> &'static str {
    match mood {
        crate::traits::Mood::Engaged => "engaged",
        crate::traits::Mood::Frustrated => "frustrated",
        crate::traits::Mood::Confused => "confused",
        crate::traits::Mood::Confident => "confident",
        crate::traits::Mood::Neutral => "neutral",
    }
}

fn internal(error: anyhow::Error) -> EngineError {
    EngineError::ExtractionFailed(error.to_string())
}
