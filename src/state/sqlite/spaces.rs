use chrono::{DateTime, Utc};
use sqlx::Row;

use super::SqliteStateStore;
use crate::traits::LearningSpace;

impl SqliteStateStore {
    pub async fn create_space(
        &self,
        user_id: &str,
        name: &str,
        topic: &str,
        goal: Option<&str>,
    ) -> anyhow::Result<LearningSpace> {
        let now = Utc::now();
        let space = LearningSpace {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            topic: topic.to_string(),
            goal: goal.map(str::to_string),
            created_at: now,
            updated_at: now,
            metadata: serde_json::json!({}),
        };

        sqlx::query(
            "INSERT INTO spaces (id, user_id, name, topic, goal, created_at, updated_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&space.id)
        .bind(&space.user_id)
        .bind(&space.name)
        .bind(&space.topic)
        .bind(&space.goal)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(space.metadata.to_string())
        .execute(&self.pool)
        .await?;

        Ok(space)
    }

    /// Ownership-scoped read: absence and wrong-owner are the same `None`.
    pub async fn get_space(
        &self,
        space_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<LearningSpace>> {
        let row = sqlx::query(
            "SELECT id, user_id, name, topic, goal, created_at, updated_at, metadata
             FROM spaces WHERE id = ? AND user_id = ?",
        )
        .bind(space_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let created_at: String = row.get("created_at");
            let updated_at: String = row.get("updated_at");
            let metadata: String = row.get("metadata");
            Ok(LearningSpace {
                id: row.get("id"),
                user_id: row.get("user_id"),
                name: row.get("name"),
                topic: row.get("topic"),
                goal: row.get("goal"),
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
                updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
                metadata: serde_json::from_str(&metadata)?,
            })
        })
        .transpose()
    }
}
