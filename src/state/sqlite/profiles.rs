use chrono::{DateTime, Utc};
use sqlx::Row;

use super::SqliteStateStore;
use crate::traits::{LearnerProfile, Mood, SessionDigest, TopicState};

impl SqliteStateStore {
    /// Assemble the learner profile from its normalized tables. A user
    /// with no rows anywhere gets an empty profile, not an error —
    /// first-session behavior degrades gracefully.
    pub async fn get_profile(&self, user_id: &str) -> anyhow::Result<LearnerProfile> {
        let mut profile = LearnerProfile::empty(user_id);

        let row = sqlx::query(
            "SELECT display_name, goals, background, preferences, current_topic, open_questions, last_session_at
             FROM profiles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            profile.display_name = row.get("display_name");
            profile.goals = row.get("goals");
            profile.background = row.get("background");
            let preferences: String = row.get("preferences");
            profile.preferences = serde_json::from_str(&preferences)?;
            profile.current_topic = row.get("current_topic");
            let open_questions: String = row.get("open_questions");
            profile.open_questions = serde_json::from_str(&open_questions)?;
            let last_session_at: Option<String> = row.get("last_session_at");
            profile.last_session_at = last_session_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
                .transpose()?;
        }

        profile.topics = self.topic_states(user_id).await?;
        profile.observations = self.style_observations(user_id).await?;
        profile.recent_sessions = self.recent_sessions(user_id).await?;

        Ok(profile)
    }

    /// All topic states for a user, most recently seen first.
    pub async fn topic_states(&self, user_id: &str) -> anyhow::Result<Vec<TopicState>> {
        let rows = sqlx::query(
            "SELECT topic, first_seen_at, last_seen_at, sessions_count, comprehension,
                    quiz_scores, last_quizzed_at, notes
             FROM topic_states WHERE user_id = ?
             ORDER BY last_seen_at DESC, topic",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let first_seen: String = row.get("first_seen_at");
                let last_seen: String = row.get("last_seen_at");
                let quiz_scores: String = row.get("quiz_scores");
                let last_quizzed: Option<String> = row.get("last_quizzed_at");
                let comprehension: Option<i64> = row.get("comprehension");
                Ok(TopicState {
                    topic: row.get("topic"),
                    first_seen_at: DateTime::parse_from_rfc3339(&first_seen)?.with_timezone(&Utc),
                    last_seen_at: DateTime::parse_from_rfc3339(&last_seen)?.with_timezone(&Utc),
                    sessions_count: row.get("sessions_count"),
                    comprehension: comprehension.map(|c| c as u8),
                    quiz_scores: serde_json::from_str(&quiz_scores)?,
                    last_quizzed_at: last_quizzed
                        .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
                        .transpose()?,
                    notes: row.get("notes"),
                })
            })
            .collect()
    }

    /// Append-only observation list, oldest first.
    pub async fn style_observations(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT observation FROM style_observations WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("observation")).collect())
    }

    /// The bounded recent-session window, newest first.
    pub async fn recent_sessions(&self, user_id: &str) -> anyhow::Result<Vec<SessionDigest>> {
        let rows = sqlx::query(
            "SELECT conversation_id, occurred_at, duration_minutes, synopsis, topics, mood
             FROM recent_sessions WHERE user_id = ? ORDER BY id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let occurred_at: String = row.get("occurred_at");
                let topics: String = row.get("topics");
                let mood: String = row.get("mood");
                Ok(SessionDigest {
                    conversation_id: row.get("conversation_id"),
                    occurred_at: DateTime::parse_from_rfc3339(&occurred_at)?.with_timezone(&Utc),
                    duration_minutes: row.get("duration_minutes"),
                    synopsis: row.get("synopsis"),
                    topics: serde_json::from_str(&topics)?,
                    mood: serde_json::from_str::<Mood>(&format!("\"{}\"", mood))
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    /// User-driven edit path: goals, background, preferences. Learning
    /// state is never written here — that is the extraction job's merge,
    /// and keeping the two write paths on disjoint columns is what makes
    /// them safe to run concurrently.
    pub async fn update_profile_fields(
        &self,
        user_id: &str,
        display_name: Option<&str>,
        goals: Option<&str>,
        background: Option<&str>,
        preferences: Option<&serde_json::Value>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO profiles (user_id, display_name, goals, background, preferences)
             VALUES (?, ?, ?, ?, COALESCE(?, '{}'))
             ON CONFLICT(user_id) DO UPDATE SET
               display_name = COALESCE(excluded.display_name, profiles.display_name),
               goals = COALESCE(excluded.goals, profiles.goals),
               background = COALESCE(excluded.background, profiles.background),
               preferences = CASE WHEN ? IS NULL THEN profiles.preferences ELSE excluded.preferences END",
        )
        .bind(user_id)
        .bind(display_name)
        .bind(goals)
        .bind(background)
        .bind(preferences.map(|p| p.to_string()))
        .bind(preferences.map(|p| p.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
