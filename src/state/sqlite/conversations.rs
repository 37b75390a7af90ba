use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use super::SqliteStateStore;
use crate::traits::{Conversation, ExtractionStatus};

impl SqliteStateStore {
    pub async fn create_conversation(
        &self,
        space_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            space_id: space_id.to_string(),
            user_id: user_id.to_string(),
            started_at: now,
            last_message_at: now,
            ended_at: None,
            summary: None,
            extraction_status: ExtractionStatus::Pending,
        };

        sqlx::query(
            "INSERT INTO conversations (id, space_id, user_id, started_at, last_message_at, extraction_status)
             VALUES (?, ?, ?, ?, ?, 'pending')",
        )
        .bind(&conversation.id)
        .bind(space_id)
        .bind(user_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(conversation)
    }

    /// Ownership-scoped read: absence and wrong-owner are the same `None`.
    pub async fn get_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, space_id, user_id, started_at, last_message_at, ended_at, summary, extraction_status
             FROM conversations WHERE id = ? AND user_id = ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_conversation).transpose()
    }

    /// Internal read without an ownership scope, for background jobs that
    /// were handed a conversation id by the engine itself.
    pub(crate) async fn get_conversation_unchecked(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, space_id, user_id, started_at, last_message_at, ended_at, summary, extraction_status
             FROM conversations WHERE id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_conversation).transpose()
    }

    /// The most recent open conversation in a space, or a fresh one.
    pub async fn get_or_create_active_conversation(
        &self,
        space_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Conversation> {
        let row = sqlx::query(
            "SELECT id, space_id, user_id, started_at, last_message_at, ended_at, summary, extraction_status
             FROM conversations
             WHERE space_id = ? AND user_id = ? AND ended_at IS NULL
             ORDER BY last_message_at DESC LIMIT 1",
        )
        .bind(space_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_conversation(row),
            None => self.create_conversation(space_id, user_id).await,
        }
    }

    pub async fn touch_last_message(&self, conversation_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE conversations SET last_message_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp `ended_at` exactly once. Returns false if the conversation
    /// was already ended — the caller must then skip the end-of-session
    /// side effects.
    pub async fn mark_ended(&self, conversation_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET ended_at = ? WHERE id = ? AND ended_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomic claim for the extraction job: only one caller ever moves
    /// `pending -> running` for a given conversation.
    pub async fn claim_extraction(&self, conversation_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET extraction_status = 'running'
             WHERE id = ? AND extraction_status = 'pending' AND ended_at IS NOT NULL",
        )
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Terminal failure: release the claim into `failed`. The profile has
    /// not been touched.
    pub async fn mark_extraction_failed(&self, conversation_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE conversations SET extraction_status = 'failed'
             WHERE id = ? AND extraction_status = 'running'",
        )
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Active conversations whose last message is older than the idle
    /// timeout; the sweeper ends these.
    pub async fn list_idle_active(
        &self,
        idle_timeout: Duration,
    ) -> anyhow::Result<Vec<Conversation>> {
        let cutoff = Utc::now() - idle_timeout;
        let rows = sqlx::query(
            "SELECT id, space_id, user_id, started_at, last_message_at, ended_at, summary, extraction_status
             FROM conversations
             WHERE ended_at IS NULL AND last_message_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_conversation).collect()
    }

    pub async fn message_count(&self, conversation_id: &str) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn row_to_conversation(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<Conversation> {
    let started_at: String = row.get("started_at");
    let last_message_at: String = row.get("last_message_at");
    let ended_at: Option<String> = row.get("ended_at");
    let status_raw: String = row.get("extraction_status");

    Ok(Conversation {
        id: row.get("id"),
        space_id: row.get("space_id"),
        user_id: row.get("user_id"),
        started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
        last_message_at: DateTime::parse_from_rfc3339(&last_message_at)?.with_timezone(&Utc),
        ended_at: ended_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
            .transpose()?,
        summary: row.get("summary"),
        extraction_status: ExtractionStatus::parse(&status_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown extraction status: {}", status_raw))?,
    })
}
