//! Concrete completion-service clients.
//!
//! The engine only ever talks to [`crate::traits::CompletionProvider`];
//! this module supplies the Anthropic Messages implementation and the
//! classified error type both the turn loop and the extraction job use to
//! pick a recovery strategy.

mod anthropic;
mod error;

pub use anthropic::AnthropicProvider;
pub use error::{ProviderError, ProviderErrorKind};

use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::traits::CompletionProvider;

/// Build the configured provider.
pub fn from_config(config: &ProviderConfig) -> anyhow::Result<Arc<dyn CompletionProvider>> {
    if config.api_key.is_empty() {
        anyhow::bail!("no completion-service API key configured (provider.api_key or ANTHROPIC_API_KEY)");
    }
    Ok(Arc::new(AnthropicProvider::new(
        &config.base_url,
        &config.api_key,
    )))
}
