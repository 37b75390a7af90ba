use chrono::{DateTime, Utc};
use sqlx::Row;

use super::SqliteStateStore;
use crate::traits::{Message, Role};

impl SqliteStateStore {
    /// Append a message. Messages are never updated after creation except
    /// for the quiz completion flip in [`Self::complete_quiz_in_message`].
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<Message> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(metadata.to_string())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            seq: result.last_insert_rowid(),
            role,
            content: content.to_string(),
            metadata,
            created_at: now,
        })
    }

    /// The last `limit` messages, returned oldest-first.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT seq, id, conversation_id, role, content, metadata, created_at
             FROM messages WHERE conversation_id = ?
             ORDER BY seq DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows
            .into_iter()
            .map(row_to_message)
            .collect::<anyhow::Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// The most recently persisted message, if any.
    pub async fn last_message(&self, conversation_id: &str) -> anyhow::Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT seq, id, conversation_id, role, content, metadata, created_at
             FROM messages WHERE conversation_id = ?
             ORDER BY seq DESC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_message).transpose()
    }

    /// The whole transcript in persisted order.
    pub async fn full_transcript(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT seq, id, conversation_id, role, content, metadata, created_at
             FROM messages WHERE conversation_id = ? ORDER BY seq",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// Look up a message and verify, through its conversation, that it is
    /// owned by the requesting user.
    pub async fn get_message_for_user(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT m.seq, m.id, m.conversation_id, m.role, m.content, m.metadata, m.created_at
             FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE m.id = ? AND c.user_id = ?",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_message).transpose()
    }

    /// Flip the embedded quiz to its completed form. The WHERE clause
    /// re-checks pending status inside the database so exactly one of two
    /// racing submissions wins; the loser sees zero rows affected.
    pub async fn complete_quiz_in_message(
        &self,
        message_id: &str,
        completed_quiz: &crate::quiz::Quiz,
    ) -> anyhow::Result<bool> {
        let quiz_json = serde_json::to_value(completed_quiz)?;
        let result = sqlx::query(
            "UPDATE messages
             SET metadata = json_set(metadata, '$.quiz', json(?))
             WHERE id = ? AND json_extract(metadata, '$.quiz.status') = 'pending'",
        )
        .bind(quiz_json.to_string())
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<Message> {
    let role_raw: String = row.get("role");
    let metadata_raw: String = row.get("metadata");
    let created_at_raw: String = row.get("created_at");

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        seq: row.get("seq"),
        role: Role::parse(&role_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown message role: {}", role_raw))?,
        content: row.get("content"),
        metadata: serde_json::from_str(&metadata_raw)?,
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)?.with_timezone(&Utc),
    })
}
