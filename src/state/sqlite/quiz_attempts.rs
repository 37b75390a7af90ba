use chrono::{DateTime, Utc};
use sqlx::Row;

use super::SqliteStateStore;
use crate::traits::QuizAttempt;

impl SqliteStateStore {
    pub async fn insert_quiz_attempt(&self, attempt: &QuizAttempt) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO quiz_attempts
               (id, user_id, space_id, conversation_id, message_id, topic, question,
                user_answer, is_correct, attempt_number, confidence, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.id)
        .bind(&attempt.user_id)
        .bind(&attempt.space_id)
        .bind(&attempt.conversation_id)
        .bind(&attempt.message_id)
        .bind(&attempt.topic)
        .bind(&attempt.question)
        .bind(&attempt.user_answer)
        .bind(attempt.is_correct as i64)
        .bind(attempt.attempt_number)
        .bind(attempt.confidence)
        .bind(attempt.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attempts recorded against one conversation, oldest first. The
    /// back-reference is weak, so this keeps working after the parent
    /// conversation is deleted only for rows queried by user instead.
    pub async fn quiz_attempts_for_conversation(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Vec<QuizAttempt>> {
        let rows = sqlx::query(
            "SELECT id, user_id, space_id, conversation_id, message_id, topic, question,
                    user_answer, is_correct, attempt_number, confidence, created_at
             FROM quiz_attempts WHERE conversation_id = ? ORDER BY rowid",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let created_at: String = row.get("created_at");
                let is_correct: i64 = row.get("is_correct");
                Ok(QuizAttempt {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    space_id: row.get("space_id"),
                    conversation_id: row.get("conversation_id"),
                    message_id: row.get("message_id"),
                    topic: row.get("topic"),
                    question: row.get("question"),
                    user_answer: row.get("user_answer"),
                    is_correct: is_correct != 0,
                    attempt_number: row.get("attempt_number"),
                    confidence: row.get("confidence"),
                    created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
                })
            })
            .collect()
    }
}
