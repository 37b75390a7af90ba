//! SQLite-backed event store: append and query, never update or delete.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use super::{EventType, LearningEvent};

#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one event. Returns the assigned row id.
    pub async fn append(&self, event: &LearningEvent) -> anyhow::Result<i64> {
        let mut conn = self.pool.acquire().await?;
        Self::append_on(&mut conn, event).await
    }

    /// Append on an explicit connection, so callers holding a transaction
    /// can land events atomically with their other writes.
    pub async fn append_on(
        conn: &mut sqlx::SqliteConnection,
        event: &LearningEvent,
    ) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO learning_events (user_id, space_id, conversation_id, event_type, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.user_id)
        .bind(&event.space_id)
        .bind(&event.conversation_id)
        .bind(event.event_type.as_str())
        .bind(event.data.to_string())
        .bind(event.created_at.to_rfc3339())
        .execute(conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Fail-open append for observability events emitted from the turn
    /// loop: a lost event is logged, never surfaced to the caller.
    pub async fn emit(&self, event: LearningEvent) {
        if let Err(error) = self.append(&event).await {
            warn!(
                event_type = event.event_type.as_str(),
                %error,
                "failed to append learning event"
            );
        }
    }

    /// All events for a conversation, in append order.
    pub async fn for_conversation(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Vec<LearningEvent>> {
        let rows = sqlx::query(
            "SELECT id, user_id, space_id, conversation_id, event_type, data, created_at
             FROM learning_events WHERE conversation_id = ? ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Events of one type for a user since a cutoff, in append order.
    pub async fn for_user_since(
        &self,
        user_id: &str,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<LearningEvent>> {
        let rows = sqlx::query(
            "SELECT id, user_id, space_id, conversation_id, event_type, data, created_at
             FROM learning_events
             WHERE user_id = ? AND event_type = ? AND created_at >= ?
             ORDER BY id",
        )
        .bind(user_id)
        .bind(event_type.as_str())
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<LearningEvent> {
    let event_type_raw: String = row.get("event_type");
    let event_type = EventType::parse(&event_type_raw)
        .ok_or_else(|| anyhow::anyhow!("unknown event type in log: {}", event_type_raw))?;
    let data_raw: String = row.get("data");
    let created_at_raw: String = row.get("created_at");
    Ok(LearningEvent {
        id: row.get("id"),
        user_id: row.get("user_id"),
        space_id: row.get("space_id"),
        conversation_id: row.get("conversation_id"),
        event_type,
        data: serde_json::from_str(&data_raw)?,
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)?.with_timezone(&Utc),
    })
}
