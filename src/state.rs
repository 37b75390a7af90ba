//! Durable storage.
//!
//! SQLite behind sqlx, WAL mode, one pool shared by the turn loop and
//! background jobs. The learner profile is stored normalized
//! (topic_states / style_observations / recent_sessions tables) so
//! concurrent extraction jobs for the same user merge field-by-field
//! instead of overwriting each other's rows.

mod sqlite;

pub use sqlite::SqliteStateStore;
