use sqlx::SqlitePool;
use tracing::info;

/// Centralized schema migrations. Every statement is safe to run more
/// than once (`IF NOT EXISTS` throughout), so startup just replays them.
pub(crate) async fn run(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS spaces (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            topic TEXT NOT NULL,
            goal TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_spaces_user ON spaces(user_id)")
        .execute(pool)
        .await?;

    // Conversations cascade from their space; extraction_status is the
    // exactly-once claim for the background job.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            space_id TEXT NOT NULL REFERENCES spaces(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            started_at TEXT NOT NULL,
            last_message_at TEXT NOT NULL,
            ended_at TEXT,
            summary TEXT,
            extraction_status TEXT NOT NULL DEFAULT 'pending'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_user
         ON conversations(user_id, last_message_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_active
         ON conversations(last_message_at) WHERE ended_at IS NULL",
    )
    .execute(pool)
    .await?;

    // Append-only; seq breaks creation-time ties and orders transcripts.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation
         ON messages(conversation_id, seq)",
    )
    .execute(pool)
    .await?;

    // Learner profile, user-editable half. Learning state lives in the
    // normalized tables below.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            user_id TEXT PRIMARY KEY,
            display_name TEXT,
            goals TEXT,
            background TEXT,
            preferences TEXT NOT NULL DEFAULT '{}',
            current_topic TEXT,
            open_questions TEXT NOT NULL DEFAULT '[]',
            last_session_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topic_states (
            user_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            sessions_count INTEGER NOT NULL DEFAULT 0,
            comprehension INTEGER,
            quiz_scores TEXT NOT NULL DEFAULT '[]',
            last_quizzed_at TEXT,
            notes TEXT,
            PRIMARY KEY (user_id, topic)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_topic_states_recency
         ON topic_states(user_id, last_seen_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS style_observations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            observation TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (user_id, observation)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Bounded most-recent-N window, pruned at write time.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recent_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            synopsis TEXT NOT NULL,
            topics TEXT NOT NULL DEFAULT '[]',
            mood TEXT NOT NULL DEFAULT 'neutral'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_recent_sessions_user
         ON recent_sessions(user_id, id DESC)",
    )
    .execute(pool)
    .await?;

    // Weak back-references only: attempts must survive deletion of their
    // parents, so no foreign keys here.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quiz_attempts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            space_id TEXT,
            conversation_id TEXT,
            message_id TEXT,
            topic TEXT NOT NULL,
            question TEXT NOT NULL,
            user_answer TEXT NOT NULL,
            is_correct INTEGER NOT NULL,
            attempt_number INTEGER NOT NULL DEFAULT 1,
            confidence REAL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_quiz_attempts_user
         ON quiz_attempts(user_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    // Append-only, no foreign keys: the log outlives its subjects.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS learning_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            space_id TEXT,
            conversation_id TEXT,
            event_type TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_user_type
         ON learning_events(user_id, event_type, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_conversation
         ON learning_events(conversation_id) WHERE conversation_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    info!("database migrations complete");
    Ok(())
}
