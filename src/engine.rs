//! The session orchestrator: the per-turn control loop.
//!
//! One `SessionEngine` serves every user. Turns on the *same*
//! conversation are serialized — a second in-flight turn is rejected as a
//! conflict rather than racing to a last-writer-wins — while different
//! conversations, including two for the same user, proceed fully in
//! parallel. Ending a session (explicitly or via the idle sweeper) emits
//! `session_ended` and spawns the extraction job exactly once; the job
//! runs detached and shares no lock with this loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{EngineError, Result};
use crate::events::{
    EventStore, EventType, LearningEvent, QuizAttemptedData, SessionEndReason, SessionEndedData,
    SessionStartedData,
};
use crate::extraction::ExtractionJob;
use crate::providers::{ProviderError, ProviderErrorKind};
use crate::quiz::{QuizAnswer, QuizStatus, parse_quiz};
use crate::state::SqliteStateStore;
use crate::traits::{
    ChatTurn, CompletionProvider, Conversation, LearningSpace, Message, ModelTier, QuizAttempt,
    Role,
};

pub struct SessionEngine {
    store: SqliteStateStore,
    events: EventStore,
    provider: Arc<dyn CompletionProvider>,
    config: Arc<AppConfig>,
    /// Conversations with a turn currently in flight.
    in_flight: Mutex<HashSet<String>>,
}

/// Result of one tutoring turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The assistant message, with any embedded quiz answer keys redacted.
    pub message: Message,
    pub has_quiz: bool,
}

impl SessionEngine {
    pub fn new(
        store: SqliteStateStore,
        provider: Arc<dyn CompletionProvider>,
        config: Arc<AppConfig>,
    ) -> Arc<Self> {
        let events = EventStore::new(store.pool().clone());
        Arc::new(Self {
            store,
            events,
            provider,
            config,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn store(&self) -> &SqliteStateStore {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Spaces and conversations
    // ------------------------------------------------------------------

    pub async fn create_space(
        &self,
        user_id: &str,
        name: &str,
        topic: &str,
        goal: Option<&str>,
    ) -> Result<LearningSpace> {
        if name.trim().is_empty() || topic.trim().is_empty() {
            return Err(EngineError::Validation(
                "space name and topic must be non-empty".to_string(),
            ));
        }
        self.store
            .create_space(user_id, name.trim(), topic.trim(), goal)
            .await
            .map_err(storage)
    }

    /// The most recent open conversation in a space, or a fresh one.
    pub async fn get_or_create_conversation(
        &self,
        user_id: &str,
        space_id: &str,
    ) -> Result<Conversation> {
        self.store
            .get_space(space_id, user_id)
            .await
            .map_err(storage)?
            .ok_or(EngineError::NotFound("space"))?;
        self.store
            .get_or_create_active_conversation(space_id, user_id)
            .await
            .map_err(storage)
    }

    // ------------------------------------------------------------------
    // The turn loop
    // ------------------------------------------------------------------

    /// Handle one tutoring turn: persist the user message, build context,
    /// call the completion service, persist the reply (parsing any
    /// embedded quiz exactly once), and report whether a quiz is pending.
    ///
    /// If the completion call fails, the user message stays persisted and
    /// the turn is reported as retryable; retrying does not duplicate it
    /// because the caller resubmits a fresh turn, not this one.
    #[tracing::instrument(skip(self, content))]
    pub async fn send_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> Result<TurnOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::Validation("message is empty".to_string()));
        }
        if content.chars().count() > self.config.tutor.max_user_message_chars {
            return Err(EngineError::Validation(format!(
                "message exceeds {} characters",
                self.config.tutor.max_user_message_chars
            )));
        }

        let conversation = self
            .store
            .get_conversation(conversation_id, user_id)
            .await
            .map_err(storage)?
            .ok_or(EngineError::NotFound("conversation"))?;
        if conversation.ended_at.is_some() {
            return Err(EngineError::Conflict(
                "conversation has already ended".to_string(),
            ));
        }

        let space = self
            .store
            .get_space(&conversation.space_id, user_id)
            .await
            .map_err(storage)?
            .ok_or(EngineError::NotFound("space"))?;

        // Serialize turns per conversation; a concurrent turn is a caller
        // bug we surface instead of racing.
        let _guard = self.claim_turn(conversation_id)?;

        let first_turn = self
            .store
            .message_count(conversation_id)
            .await
            .map_err(storage)?
            == 0;

        // The inbound message is durable before the upstream call and is
        // never rolled back. A retry of a turn that failed upstream finds
        // its own message already at the tail and must not duplicate it.
        let last = self
            .store
            .last_message(conversation_id)
            .await
            .map_err(storage)?;
        let is_retry = last
            .as_ref()
            .is_some_and(|m| m.role == Role::User && m.content == content);
        if !is_retry {
            self.store
                .append_message(conversation_id, Role::User, content, json!({}))
                .await
                .map_err(storage)?;
        }

        if first_turn {
            self.events
                .emit(
                    LearningEvent::new(
                        user_id,
                        EventType::SessionStarted,
                        json!(SessionStartedData {
                            space_id: space.id.clone(),
                        }),
                    )
                    .in_space(space.id.clone())
                    .in_conversation(conversation_id),
                )
                .await;
        }

        let tail = self
            .store
            .recent_messages(conversation_id, self.config.tutor.context_messages)
            .await
            .map_err(storage)?;
        let profile = self
            .store
            .get_profile(user_id)
            .await
            .map_err(storage)?;
        let quiz_history: Vec<_> = tail.iter().filter_map(Message::quiz).collect();

        let system_prompt =
            crate::prompt::assemble(&profile, &space, &tail, &quiz_history, &self.config.tutor);
        let turns: Vec<ChatTurn> = tail
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| ChatTurn::new(m.role, m.content.clone()))
            .collect();

        let model = self.config.provider.models.for_tier(ModelTier::Primary);
        let completion = self
            .provider
            .complete(model, &system_prompt, &turns, self.config.provider.max_tokens)
            .await
            .map_err(|error| match error.downcast::<ProviderError>() {
                Ok(provider_error) => EngineError::Upstream(provider_error),
                Err(other) => EngineError::Upstream(ProviderError {
                    kind: ProviderErrorKind::Unknown,
                    status: None,
                    message: other.to_string(),
                    retry_after_secs: None,
                }),
            })?;

        // Parse-once: the quiz payload is typed here and never re-read
        // from the markup again.
        let quiz = parse_quiz(&completion.text);
        let mut metadata = json!({});
        if let Some(ref quiz) = quiz {
            metadata["quiz"] = serde_json::to_value(quiz).map_err(|e| {
                EngineError::Validation(format!("failed to serialize quiz: {}", e))
            })?;
        }
        if let Some(ref usage) = completion.usage {
            metadata["usage"] = json!({
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
            });
        }

        let assistant_message = self
            .store
            .append_message(conversation_id, Role::Assistant, &completion.text, metadata)
            .await
            .map_err(storage)?;
        self.store
            .touch_last_message(conversation_id)
            .await
            .map_err(storage)?;

        info!(
            conversation_id,
            has_quiz = quiz.is_some(),
            "turn completed"
        );

        Ok(TurnOutcome {
            has_quiz: quiz.is_some(),
            message: redact_message(assistant_message),
        })
    }

    // ------------------------------------------------------------------
    // Quiz submission
    // ------------------------------------------------------------------

    /// Grade and record a quiz submission. Exactly one submission can
    /// complete a quiz: a second one is rejected as a conflict and the
    /// stored responses are untouched.
    #[tracing::instrument(skip(self, answers))]
    pub async fn submit_quiz_response(
        &self,
        user_id: &str,
        message_id: &str,
        answers: &[QuizAnswer],
    ) -> Result<Message> {
        let message = self
            .store
            .get_message_for_user(message_id, user_id)
            .await
            .map_err(storage)?
            .ok_or(EngineError::NotFound("message"))?;

        let quiz = message
            .quiz()
            .ok_or_else(|| EngineError::Conflict("message has no pending quiz".to_string()))?;
        if quiz.status == QuizStatus::Completed {
            return Err(EngineError::Conflict(
                "quiz has already been completed".to_string(),
            ));
        }

        let responses = quiz.grade(answers)?;
        let completed = quiz.complete(responses, chrono::Utc::now());

        // Optimistic completion: the database re-checks pending status, so
        // a racing submission loses cleanly instead of re-applying.
        let won = self
            .store
            .complete_quiz_in_message(message_id, &completed)
            .await
            .map_err(storage)?;
        if !won {
            return Err(EngineError::Conflict(
                "quiz has already been completed".to_string(),
            ));
        }

        let conversation = self
            .store
            .get_conversation(&message.conversation_id, user_id)
            .await
            .map_err(storage)?
            .ok_or(EngineError::NotFound("conversation"))?;
        let topic = self
            .store
            .get_space(&conversation.space_id, user_id)
            .await
            .map_err(storage)?
            .map(|space| space.topic)
            .unwrap_or_default();

        // Mirror each graded answer into an analytics row. Weak
        // references only: these rows outlive the conversation.
        for response in &completed.responses {
            let question_text = completed
                .questions
                .iter()
                .find(|q| q.id == response.question_id)
                .map(|q| q.text.clone())
                .unwrap_or_default();
            let attempt = QuizAttempt {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                space_id: Some(conversation.space_id.clone()),
                conversation_id: Some(conversation.id.clone()),
                message_id: Some(message_id.to_string()),
                topic: topic.clone(),
                question: question_text,
                user_answer: response.user_answer.clone(),
                is_correct: response.is_correct,
                attempt_number: 1,
                confidence: None,
                created_at: chrono::Utc::now(),
            };
            if let Err(error) = self.store.insert_quiz_attempt(&attempt).await {
                warn!(message_id, %error, "failed to record quiz attempt");
            }
        }

        let correct = completed.responses.iter().filter(|r| r.is_correct).count() as i64;
        self.events
            .emit(
                LearningEvent::new(
                    user_id,
                    EventType::QuizAttempted,
                    json!(QuizAttemptedData {
                        topic,
                        correct,
                        attempts: completed.questions.len() as i64,
                    }),
                )
                .in_space(conversation.space_id.clone())
                .in_conversation(conversation.id.clone()),
            )
            .await;

        let updated = self
            .store
            .get_message_for_user(message_id, user_id)
            .await
            .map_err(storage)?
            .ok_or(EngineError::NotFound("message"))?;
        Ok(redact_message(updated))
    }

    // ------------------------------------------------------------------
    // Session end and extraction hand-off
    // ------------------------------------------------------------------

    /// Explicitly end a session. Ending twice is a no-op; the extraction
    /// job is enqueued exactly once, and an already-running job is never
    /// cancelled by this call.
    pub async fn end_session(&self, user_id: &str, conversation_id: &str) -> Result<()> {
        let conversation = self
            .store
            .get_conversation(conversation_id, user_id)
            .await
            .map_err(storage)?
            .ok_or(EngineError::NotFound("conversation"))?;
        self.finish_session(&conversation, SessionEndReason::UserEnded)
            .await
    }

    /// Shared end-of-session path for explicit ends and the idle sweeper.
    /// Only the call that wins the `ended_at` stamp emits the event and
    /// spawns extraction.
    pub(crate) async fn finish_session(
        &self,
        conversation: &Conversation,
        reason: SessionEndReason,
    ) -> Result<()> {
        if !self
            .store
            .mark_ended(&conversation.id)
            .await
            .map_err(storage)?
        {
            return Ok(());
        }

        let message_count = self
            .store
            .message_count(&conversation.id)
            .await
            .map_err(storage)?;
        let (input_tokens, output_tokens) = self
            .session_token_usage(&conversation.id)
            .await
            .unwrap_or((None, None));
        let duration_minutes = (chrono::Utc::now() - conversation.started_at)
            .num_minutes()
            .max(0);

        info!(
            conversation_id = %conversation.id,
            ?reason,
            duration_minutes,
            message_count,
            "session ended"
        );

        self.events
            .emit(
                LearningEvent::new(
                    conversation.user_id.clone(),
                    EventType::SessionEnded,
                    json!(SessionEndedData {
                        reason,
                        duration_minutes,
                        message_count,
                        input_tokens,
                        output_tokens,
                    }),
                )
                .in_space(conversation.space_id.clone())
                .in_conversation(conversation.id.clone()),
            )
            .await;

        self.spawn_extraction(conversation.id.clone());
        Ok(())
    }

    /// Detach the extraction job for an ended conversation. Runs on its
    /// own task; failures are recorded in the event log, never surfaced
    /// to the user.
    pub(crate) fn spawn_extraction(&self, conversation_id: String) {
        let job = ExtractionJob::new(
            self.store.clone(),
            self.events.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.config),
        );
        tokio::spawn(async move {
            if let Err(error) = job.run(&conversation_id).await {
                warn!(conversation_id = %conversation_id, %error, "extraction job failed");
            }
        });
    }

    /// Run the extraction job inline. Tests and operator tooling use this
    /// to await the result the spawned path only logs.
    pub async fn run_extraction_now(
        &self,
        conversation_id: &str,
    ) -> Result<crate::extraction::ExtractionOutcome> {
        let job = ExtractionJob::new(
            self.store.clone(),
            self.events.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.config),
        );
        job.run(conversation_id).await
    }

    async fn session_token_usage(
        &self,
        conversation_id: &str,
    ) -> Result<(Option<u64>, Option<u64>)> {
        let transcript = self
            .store
            .full_transcript(conversation_id)
            .await
            .map_err(storage)?;
        let mut input = 0u64;
        let mut output = 0u64;
        let mut seen = false;
        for message in &transcript {
            if let Some(usage) = message.metadata.get("usage") {
                seen = true;
                input += usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                output += usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            }
        }
        if seen {
            Ok((Some(input), Some(output)))
        } else {
            Ok((None, None))
        }
    }

    fn claim_turn(&self, conversation_id: &str) -> Result<TurnGuard<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !in_flight.insert(conversation_id.to_string()) {
            return Err(EngineError::Conflict(
                "another turn is in flight on this conversation".to_string(),
            ));
        }
        Ok(TurnGuard {
            engine: self,
            conversation_id: conversation_id.to_string(),
        })
    }
}

/// RAII release of the per-conversation turn claim.
struct TurnGuard<'a> {
    engine: &'a SessionEngine,
    conversation_id: String,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self
            .engine
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.remove(&self.conversation_id);
    }
}

/// Strip answer keys from a message before it leaves the engine. Stored
/// state keeps the full quiz; callers only ever see the redacted form.
fn redact_message(mut message: Message) -> Message {
    if let Some(quiz) = message.quiz() {
        message.metadata["quiz"] = quiz.redacted();
    }
    message
}

fn storage(error: anyhow::Error) -> EngineError {
    EngineError::Storage(error)
}
