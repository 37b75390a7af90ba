use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::providers::ProviderError;
use crate::traits::{ChatTurn, CompletionProvider, CompletionText, Role, TokenUsage};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client, text-only. Requests carry a hard timeout
/// so a hung call cancels instead of pinning a turn; no state is written
/// until a response has fully parsed.
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// The Messages API requires user/assistant roles to strictly
    /// alternate. System turns are folded into the adjacent user turn and
    /// consecutive same-role turns are merged.
    fn build_messages(turns: &[ChatTurn]) -> Vec<Value> {
        let mut messages: Vec<(String, String)> = Vec::new();

        for turn in turns {
            let role = match turn.role {
                Role::Assistant => "assistant",
                // System context inside the tail reads as user-side input.
                Role::User | Role::System => "user",
            };
            if let Some((last_role, last_content)) = messages.last_mut() {
                if last_role.as_str() == role {
                    last_content.push_str("\n\n");
                    last_content.push_str(&turn.content);
                    continue;
                }
            }
            messages.push((role.to_string(), turn.content.clone()));
        }

        // The API rejects a leading assistant turn.
        if messages.first().is_some_and(|(role, _)| role == "assistant") {
            messages.insert(0, ("user".to_string(), "(continue)".to_string()));
        }

        messages
            .into_iter()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect()
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        turns: &[ChatTurn],
        max_tokens: u32,
    ) -> anyhow::Result<CompletionText> {
        let messages = Self::build_messages(turns);
        if messages.is_empty() {
            return Err(anyhow::Error::new(ProviderError::malformed(
                "no turns to send",
            )));
        }

        let body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": messages,
        });

        debug!(model, turns = messages.len(), "calling completion service");

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::Error::new(ProviderError::network(&e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow::Error::new(ProviderError::network(&e)))?;

        if !status.is_success() {
            let mut err = ProviderError::from_status(status.as_u16(), &text);
            if err.kind == crate::providers::ProviderErrorKind::RateLimit {
                // Retry-After lands in the JSON body for this API.
                err.retry_after_secs = serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v.get("error")?.get("retry_after")?.as_u64());
            }
            return Err(anyhow::Error::new(err));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| anyhow::Error::new(ProviderError::malformed(e.to_string())))?;

        let content = parsed
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            })
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                anyhow::Error::new(ProviderError::malformed("response has no text block"))
            })?;

        let usage = parsed.get("usage").map(|u| TokenUsage {
            input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            output_tokens: u
                .get("output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            model: model.to_string(),
        });

        Ok(CompletionText {
            text: content.to_string(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, content: &str) -> ChatTurn {
        ChatTurn::new(role, content)
    }

    #[test]
    fn merges_adjacent_same_role_turns() {
        let turns = vec![
            turn(Role::User, "first"),
            turn(Role::User, "second"),
            turn(Role::Assistant, "reply"),
        ];
        let messages = AnthropicProvider::build_messages(&turns);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "first\n\nsecond");
    }

    #[test]
    fn system_turns_fold_into_user_side() {
        let turns = vec![turn(Role::System, "note"), turn(Role::User, "question")];
        let messages = AnthropicProvider::build_messages(&turns);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn leading_assistant_turn_gets_a_user_anchor() {
        let turns = vec![turn(Role::Assistant, "welcome back")];
        let messages = AnthropicProvider::build_messages(&turns);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
    }
}
