//! Error types for the ranked engine
//!
//! Engine operations return a typed [`EngineError`] so callers can tell a
//! rejected command apart from a lost race or an infrastructure failure.
//! Binaries and service wiring use `anyhow` on top of this.

use crate::types::{MatchId, Phase, PlayerId};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the queue, matchmaking, phase and outcome components
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Illegal phase transition for match {match_id}: {from} -> {to}")]
    InvalidTransition {
        match_id: MatchId,
        from: Phase,
        to: Phase,
    },

    #[error("Player {player_id} is not a participant of match {match_id}")]
    NotParticipant { match_id: MatchId, player_id: PlayerId },

    #[error("It is not {player_id}'s turn in match {match_id}")]
    NotYourTurn { match_id: MatchId, player_id: PlayerId },

    #[error("State conflict on match {match_id}: expected {expected}, found {actual}")]
    StateConflict {
        match_id: MatchId,
        expected: Phase,
        actual: Phase,
    },

    #[error("Match not found: {match_id}")]
    MatchNotFound { match_id: MatchId },

    #[error("Player not found: {player_id}")]
    PlayerNotFound { player_id: PlayerId },

    #[error("Player {player_id} is already queued")]
    AlreadyQueued { player_id: PlayerId },

    #[error("Player {player_id} is already in match {match_id}")]
    AlreadyInMatch { player_id: PlayerId, match_id: MatchId },

    #[error("Player {player_id} has been inactive for more than {window_days} days")]
    Inactive { player_id: PlayerId, window_days: i64 },

    #[error("Player {player_id} is not queued")]
    NotQueued { player_id: PlayerId },

    #[error("Player {player_id} has no active match to report for")]
    NoActiveMatch { player_id: PlayerId },

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl EngineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        EngineError::Validation {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::InternalError {
            message: message.into(),
        }
    }

    /// Only lost compare-and-swap races are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StateConflict { .. })
    }

    /// Stable machine-readable code, sent back to the command layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::NotParticipant { .. }
            | EngineError::NotYourTurn { .. } => "validation",
            EngineError::StateConflict { .. } => "state_conflict",
            EngineError::MatchNotFound { .. } | EngineError::PlayerNotFound { .. } => "not_found",
            EngineError::AlreadyQueued { .. } => "already_queued",
            EngineError::AlreadyInMatch { .. } => "already_in_match",
            EngineError::Inactive { .. } => "inactive",
            EngineError::NotQueued { .. } => "not_queued",
            EngineError::NoActiveMatch { .. } => "no_active_match",
            EngineError::AmqpConnectionFailed { .. }
            | EngineError::Storage { .. }
            | EngineError::InternalError { .. } => "internal",
        }
    }
}
