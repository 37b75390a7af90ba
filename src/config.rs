use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub tutor: TutorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// API key for the completion service. Empty means "resolve from the
    /// ANTHROPIC_API_KEY environment variable at load time".
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            models: ModelsConfig::default(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

/// Model tiers. Tutoring turns use `primary`; background analysis uses
/// `fast`, which trades quality for cost the way the extraction workload
/// tolerates.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModelsConfig {
    #[serde(default)]
    pub primary: String,
    #[serde(default)]
    pub fast: String,
}

impl ModelsConfig {
    /// Fill in unset model tiers. `fast` defaults to `primary`; `primary`
    /// defaults to a sensible tutoring model.
    pub fn apply_defaults(&mut self) {
        if self.primary.is_empty() {
            self.primary = "claude-sonnet-4-20250514".to_string();
        }
        if self.fast.is_empty() {
            self.fast = self.primary.clone();
        }
    }

    pub fn for_tier(&self, tier: crate::traits::ModelTier) -> &str {
        match tier {
            crate::traits::ModelTier::Primary => &self.primary,
            crate::traits::ModelTier::Fast => &self.fast,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TutorConfig {
    /// How many trailing messages of the conversation go into the prompt.
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,
    /// Per-message character cap when formatting the tail for the prompt.
    #[serde(default = "default_context_message_chars")]
    pub context_message_chars: usize,
    /// How many topics from the profile go into the prompt, most recently
    /// seen first.
    #[serde(default = "default_recent_topics")]
    pub recent_topics: usize,
    /// How many of the session's quizzes are summarized in the prompt.
    #[serde(default = "default_recent_quizzes")]
    pub recent_quizzes: usize,
    /// Upper bound on inbound user message length.
    #[serde(default = "default_max_user_message_chars")]
    pub max_user_message_chars: usize,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            context_messages: default_context_messages(),
            context_message_chars: default_context_message_chars(),
            recent_topics: default_recent_topics(),
            recent_quizzes: default_recent_quizzes(),
            max_user_message_chars: default_max_user_message_chars(),
        }
    }
}

fn default_context_messages() -> usize {
    20
}

fn default_context_message_chars() -> usize {
    500
}

fn default_recent_topics() -> usize {
    10
}

fn default_recent_quizzes() -> usize {
    3
}

fn default_max_user_message_chars() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// A conversation with no message for this long is ended by the sweeper.
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: default_idle_timeout_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_idle_timeout_minutes() -> i64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Attempts per extraction before the job is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts (seconds).
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    /// How many session digests the profile keeps. Older digests are
    /// evicted at write time; this is a documented lossy cache, not an
    /// audit log.
    #[serde(default = "default_max_recent_sessions")]
    pub max_recent_sessions: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            max_recent_sessions: default_max_recent_sessions(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    2
}

fn default_max_recent_sessions() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "blossom.db".to_string()
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let mut config: AppConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))?;

        config.provider.models.apply_defaults();
        if config.provider.api_key.is_empty() {
            if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
                config.provider.api_key = key;
            }
        }
        Ok(config)
    }
}
