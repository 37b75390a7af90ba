//! Test infrastructure: MockProvider and a fully wired engine harness.
//!
//! The harness runs the real engine, real stores, and real extraction
//! pipeline over an in-memory SQLite database; only the completion
//! service is scripted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::engine::SessionEngine;
use crate::providers::ProviderError;
use crate::state::SqliteStateStore;
use crate::traits::{
    ChatTurn, CompletionProvider, CompletionText, Conversation, LearningSpace, TokenUsage,
};

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A recorded call to `MockProvider::complete()`.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct MockCompletionCall {
    pub model: String,
    pub system: String,
    pub turns: Vec<ChatTurn>,
}

/// Mock completion service that returns scripted responses in FIFO order.
pub struct MockProvider {
    responses: Mutex<Vec<Result<CompletionText, ProviderError>>>,
    pub call_log: Mutex<Vec<MockCompletionCall>>,
    /// Artificial latency per call; lets tests hold a turn in flight.
    delay: Option<Duration>,
}

impl MockProvider {
    /// A provider that always returns "Mock response".
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            call_log: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a plain text response.
    pub async fn push_text(&self, text: &str) {
        self.responses
            .lock()
            .await
            .push(Ok(Self::text_response(text)));
    }

    /// Queue a failure with the given HTTP status classification.
    pub async fn push_failure(&self, status: u16) {
        self.responses
            .lock()
            .await
            .push(Err(ProviderError::from_status(status, "scripted failure")));
    }

    pub fn text_response(text: &str) -> CompletionText {
        CompletionText {
            text: text.to_string(),
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                model: "mock".to_string(),
            }),
        }
    }

    pub async fn call_count(&self) -> usize {
        self.call_log.lock().await.len()
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        turns: &[ChatTurn],
        _max_tokens: u32,
    ) -> anyhow::Result<CompletionText> {
        self.call_log.lock().await.push(MockCompletionCall {
            model: model.to_string(),
            system: system.to_string(),
            turns: turns.to_vec(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            return Ok(Self::text_response("Mock response"));
        }
        responses.remove(0).map_err(anyhow::Error::new)
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub engine: Arc<SessionEngine>,
    pub provider: Arc<MockProvider>,
    pub store: SqliteStateStore,
}

/// Wire a real engine over in-memory SQLite with a scripted provider.
/// Retry backoff is zeroed so failure tests run instantly.
pub async fn harness() -> TestHarness {
    harness_with_provider(MockProvider::new()).await
}

pub async fn harness_with_provider(provider: MockProvider) -> TestHarness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();

    let store = SqliteStateStore::connect_in_memory()
        .await
        .expect("in-memory store");

    let mut config = AppConfig::default();
    config.provider.models.apply_defaults();
    config.extraction.retry_base_delay_secs = 0;

    let provider = Arc::new(provider);
    let engine = SessionEngine::new(
        store.clone(),
        Arc::clone(&provider) as Arc<dyn CompletionProvider>,
        Arc::new(config),
    );

    TestHarness {
        engine,
        provider,
        store,
    }
}

impl TestHarness {
    /// Create a space and an active conversation for the given user.
    pub async fn start_session(
        &self,
        user_id: &str,
        topic: &str,
    ) -> (LearningSpace, Conversation) {
        let space = self
            .engine
            .create_space(user_id, topic, topic, None)
            .await
            .expect("create space");
        let conversation = self
            .engine
            .get_or_create_conversation(user_id, &space.id)
            .await
            .expect("create conversation");
        (space, conversation)
    }

    /// Poll until the extraction job for the conversation has fully
    /// finished — terminal `background_job_*` event appended, status
    /// stamped. Panics after ~2s: a test that gets here is already broken.
    pub async fn wait_for_extraction(
        &self,
        conversation_id: &str,
    ) -> crate::traits::ExtractionStatus {
        for _ in 0..200 {
            let events = self
                .engine
                .events()
                .for_conversation(conversation_id)
                .await
                .expect("read events");
            let finished = events.iter().any(|e| {
                matches!(
                    e.event_type,
                    crate::events::EventType::BackgroundJobCompleted
                        | crate::events::EventType::BackgroundJobFailed
                )
            });
            if finished {
                let conversation = self
                    .store
                    .get_conversation_unchecked(conversation_id)
                    .await
                    .expect("read conversation")
                    .expect("conversation exists");
                return conversation.extraction_status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("extraction for {} never finished", conversation_id);
    }
}

/// A scripted analysis response for the extraction stage.
pub fn analysis_response(topics: &[(&str, Option<u8>)], mood: &str, synopsis: &str) -> String {
    let topic_values: Vec<serde_json::Value> = topics
        .iter()
        .map(|(name, comprehension)| {
            json!({ "name": name, "comprehension": comprehension, "evidence": null })
        })
        .collect();
    json!({
        "synopsis": synopsis,
        "mood": mood,
        "topics": topic_values,
        "assessments": [],
        "observations": [],
        "open_questions": [],
        "next_topic": null,
        "flags": {"frustration": false, "struggle": false, "breakthrough": false, "practice_requested": false}
    })
    .to_string()
}

/// An assistant reply embedding the standard two-question checkpoint quiz
/// used across the integration tests.
pub const QUIZ_REPLY: &str = r#"Good progress on the chain rule. Let me see if this is solid.

<quiz>
<question id="1">
What is the derivative of sin(x^2)?
<options>
A. 2x cos(x^2)
B. cos(x^2)
C. 2x sin(x^2)
</options>
<answer>A</answer>
</question>
<question id="2">
Which rule do you apply first when differentiating f(g(x))?
<options>
A. Product rule
B. Chain rule
</options>
<answer>B</answer>
</question>
</quiz>"#;
