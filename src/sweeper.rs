//! Idle-session sweep.
//!
//! A conversation with no message for the configured timeout is ended as
//! if the user had closed it, through the same single end-of-session path
//! — so the `session_ended` event and the extraction hand-off behave
//! identically for both. The sweep is a periodic background tick rather
//! than a lazy check on next access: an abandoned session gets extracted
//! even if the user never comes back.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::SessionEngine;
use crate::events::SessionEndReason;

/// Spawn the sweep loop as a background task.
pub fn spawn_idle_sweeper(engine: Arc<SessionEngine>) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(engine_config(&engine).sweep_interval_secs);
    info!(interval_secs = interval.as_secs(), "idle-session sweeper started");
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = tick(&engine).await {
                error!("idle sweep tick failed: {}", e);
            }
        }
    })
}

/// One sweep pass: end every active conversation past the idle timeout.
/// Public so tests and operator tooling can drive a pass directly.
pub async fn tick(engine: &Arc<SessionEngine>) -> anyhow::Result<()> {
    let timeout = chrono::Duration::minutes(engine_config(engine).idle_timeout_minutes);
    let idle = engine.store().list_idle_active(timeout).await?;

    for conversation in idle {
        info!(
            conversation_id = %conversation.id,
            last_message_at = %conversation.last_message_at,
            "ending idle conversation"
        );
        if let Err(e) = engine
            .finish_session(&conversation, SessionEndReason::Timeout)
            .await
        {
            error!(conversation_id = %conversation.id, "failed to end idle conversation: {}", e);
        }
    }
    Ok(())
}

fn engine_config(engine: &Arc<SessionEngine>) -> crate::config::SessionConfig {
    engine.config().session.clone()
}
