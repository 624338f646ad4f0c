//! AMQP message definitions and serialization

use crate::error::{EngineError, Result};
use crate::types::{MatchId, Notification, PlayerId, Region};
use serde::{Deserialize, Serialize};

/// Queue the command layer publishes player actions to
pub const COMMAND_QUEUE: &str = "ranked.commands";
/// Topic exchange for outbound notifications
pub const NOTIFICATION_EXCHANGE: &str = "ranked.notifications";

/// Routing key prefix for notifications, followed by the notification kind
pub const NOTIFICATION_ROUTING_PREFIX: &str = "notify";

/// Message envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    /// Create a new message envelope
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| EngineError::internal(format!("Failed to serialize message: {}", e)))
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::validation(format!("Failed to deserialize message: {}", e)))
    }
}

/// Player actions accepted from the command layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineCommand {
    JoinQueue {
        player_id: PlayerId,
        region: Region,
    },
    LeaveQueue {
        player_id: PlayerId,
    },
    SubmitStageBan {
        match_id: MatchId,
        player_id: PlayerId,
        stage: String,
    },
    SubmitCaptainPick {
        match_id: MatchId,
        player_id: PlayerId,
        captain: String,
    },
    SubmitHostChoice {
        match_id: MatchId,
        player_id: PlayerId,
    },
    SubmitRoomCode {
        match_id: MatchId,
        host_id: PlayerId,
        code: String,
    },
    ReportScore {
        match_id: MatchId,
        player_id: PlayerId,
        self_score: u32,
        opponent_score: u32,
    },
    CancelMatch {
        match_id: MatchId,
        reason: String,
    },
}

impl EngineCommand {
    /// Short name used in logs and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::JoinQueue { .. } => "join_queue",
            EngineCommand::LeaveQueue { .. } => "leave_queue",
            EngineCommand::SubmitStageBan { .. } => "submit_stage_ban",
            EngineCommand::SubmitCaptainPick { .. } => "submit_captain_pick",
            EngineCommand::SubmitHostChoice { .. } => "submit_host_choice",
            EngineCommand::SubmitRoomCode { .. } => "submit_room_code",
            EngineCommand::ReportScore { .. } => "report_score",
            EngineCommand::CancelMatch { .. } => "cancel_match",
        }
    }

    /// The player who issued the command, if it came from a player
    pub fn issuer(&self) -> Option<&str> {
        match self {
            EngineCommand::JoinQueue { player_id, .. }
            | EngineCommand::LeaveQueue { player_id }
            | EngineCommand::SubmitStageBan { player_id, .. }
            | EngineCommand::SubmitCaptainPick { player_id, .. }
            | EngineCommand::SubmitHostChoice { player_id, .. }
            | EngineCommand::ReportScore { player_id, .. } => Some(player_id),
            EngineCommand::SubmitRoomCode { host_id, .. } => Some(host_id),
            EngineCommand::CancelMatch { .. } => None,
        }
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    /// Deserialize and validate a command, accepting either a bare command or
    /// one wrapped in a [`MessageEnvelope`]
    pub fn deserialize_command(bytes: &[u8]) -> Result<EngineCommand> {
        let command = match serde_json::from_slice::<MessageEnvelope<EngineCommand>>(bytes) {
            Ok(envelope) => envelope.payload,
            Err(_) => serde_json::from_slice::<EngineCommand>(bytes).map_err(|e| {
                EngineError::validation(format!("Failed to deserialize command: {}", e))
            })?,
        };

        Self::validate_command(&command)?;
        Ok(command)
    }

    /// Shape checks that do not need the store
    pub fn validate_command(command: &EngineCommand) -> Result<()> {
        if let Some(issuer) = command.issuer() {
            if issuer.trim().is_empty() {
                return Err(EngineError::validation("Player ID cannot be empty"));
            }
        }

        match command {
            EngineCommand::JoinQueue { region, .. } if region.trim().is_empty() => {
                Err(EngineError::validation("Region cannot be empty"))
            }
            EngineCommand::SubmitStageBan { stage, .. } if stage.trim().is_empty() => {
                Err(EngineError::validation("Stage cannot be empty"))
            }
            EngineCommand::SubmitCaptainPick { captain, .. } if captain.trim().is_empty() => {
                Err(EngineError::validation("Captain cannot be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Serialize any AMQP message to bytes
    pub fn serialize_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message)
            .map_err(|e| EngineError::internal(format!("Failed to serialize message: {}", e)))
    }

    /// Routing key for a notification, e.g. `notify.match_found`
    pub fn notification_routing_key(notification: &Notification) -> String {
        format!(
            "{}.{}",
            NOTIFICATION_ROUTING_PREFIX,
            notification.kind.as_str()
        )
    }
}
