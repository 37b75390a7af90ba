//! Tutoring session engine for the Blossom AI tutor.
//!
//! The engine owns three things and deliberately nothing else:
//! - the per-turn loop that assembles context, calls the completion
//!   provider, and persists the exchange ([`engine::SessionEngine`]),
//! - the checkpoint-quiz state machine embedded in assistant messages
//!   ([`quiz`]),
//! - the asynchronous extraction job that distills an ended conversation
//!   into durable per-topic learner state ([`extraction`]).
//!
//! Transport, rendering, and identity are the caller's problem. The
//! completion service is consumed behind [`traits::CompletionProvider`];
//! durable state lives in SQLite behind [`state::SqliteStateStore`].

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod extraction;
pub mod prompt;
pub mod providers;
pub mod quiz;
pub mod state;
pub mod sweeper;
pub mod traits;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use engine::{SessionEngine, TurnOutcome};
pub use error::{EngineError, Result};
