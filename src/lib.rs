//! Ranked Room - ranked 1v1 matchmaking and match lifecycle
//!
//! This crate pairs queued players by skill, walks each match through its
//! pre-game negotiation phases, reconciles the two players' score reports and
//! applies the resulting rep changes to players and clubs.

pub mod amqp;
pub mod clock;
pub mod club;
pub mod config;
pub mod engine;
pub mod error;
pub mod matchmaking;
pub mod metrics;
pub mod outcome;
pub mod phase;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{EngineError, Result};
pub use types::*;

// Re-export key components
pub use amqp::publisher::NotificationPublisher;
pub use club::ClubLeagueProvider;
pub use engine::{RankedEngine, RankedEngineBuilder};
pub use store::{DocumentStore, InMemoryDocumentStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
