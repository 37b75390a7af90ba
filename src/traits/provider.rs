use async_trait::async_trait;

use super::Role;

/// Completion service — sends system instructions plus a conversation tail
/// to a language model, gets back text.
///
/// The returned text is arbitrary UTF-8; callers must validate any
/// structured markup (quiz blocks, extraction JSON) before trusting it.
/// Errors should be [`crate::providers::ProviderError`] wrapped in anyhow
/// so callers can classify retryability by downcasting.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        turns: &[ChatTurn],
        max_tokens: u32,
    ) -> anyhow::Result<CompletionText>;
}

/// Cost/quality hint for model routing. Which concrete model answers a
/// tier is configuration, not core logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Tutoring turns: quality matters.
    Primary,
    /// Background analysis: cheap and good enough.
    Fast,
}

/// One turn of the transcript tail sent to the model.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The model's response text plus whatever usage accounting the provider
/// reported.
#[derive(Debug, Clone)]
pub struct CompletionText {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Token usage statistics from a completion call.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
}
