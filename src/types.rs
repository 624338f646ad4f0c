//! Common types used throughout the ranked engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for players
pub type PlayerId = String;

/// Unique identifier for matches
pub type MatchId = Uuid;

/// Unique identifier for clubs
pub type ClubId = String;

/// Region code a player queues from, e.g. "NA" or "EU"
pub type Region = String;

/// Rep thresholds for each tier, lowest first. The top tier has no upper bound.
pub const TIER_THRESHOLDS: [(RankTier, u32); 7] = [
    (RankTier::Bronze, 0),
    (RankTier::Silver, 1000),
    (RankTier::Gold, 2000),
    (RankTier::Platinum, 3000),
    (RankTier::Diamond, 4000),
    (RankTier::Mythic, 5500),
    (RankTier::Legendary, 7500),
];

/// Named rank band derived from cumulative rep
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RankTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
    Mythic,
    Legendary,
}

impl RankTier {
    /// Highest tier whose threshold is at or below `rep`.
    pub fn for_rep(rep: u32) -> Self {
        TIER_THRESHOLDS
            .iter()
            .rev()
            .find(|(_, threshold)| rep >= *threshold)
            .map(|(tier, _)| *tier)
            .unwrap_or(RankTier::Bronze)
    }

    /// Ordinal used by the matchmaking scorer (0 for Bronze, 6 for Legendary).
    pub fn points(self) -> u32 {
        self as u32
    }

    pub fn threshold(self) -> u32 {
        TIER_THRESHOLDS[self as usize].1
    }
}

impl std::fmt::Display for RankTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RankTier::Bronze => "Bronze",
            RankTier::Silver => "Silver",
            RankTier::Gold => "Gold",
            RankTier::Platinum => "Platinum",
            RankTier::Diamond => "Diamond",
            RankTier::Mythic => "Mythic",
            RankTier::Legendary => "Legendary",
        };
        write!(f, "{}", name)
    }
}

/// Match lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pregame,
    StageSelect,
    CaptainSelect,
    HostSelect,
    RoomCode,
    Active,
    Completed,
    Cancelled,
    Disputed,
    Failed,
}

impl Phase {
    /// Terminal phases are never left again; the match is kept as history.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::Cancelled | Phase::Disputed | Phase::Failed
        )
    }

    /// Next phase on the happy path, if any.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Pregame => Some(Phase::StageSelect),
            Phase::StageSelect => Some(Phase::CaptainSelect),
            Phase::CaptainSelect => Some(Phase::HostSelect),
            Phase::HostSelect => Some(Phase::RoomCode),
            Phase::RoomCode => Some(Phase::Active),
            Phase::Active => Some(Phase::Completed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pregame => "PREGAME",
            Phase::StageSelect => "STAGE_SELECT",
            Phase::CaptainSelect => "CAPTAIN_SELECT",
            Phase::HostSelect => "HOST_SELECT",
            Phase::RoomCode => "ROOM_CODE",
            Phase::Active => "ACTIVE",
            Phase::Completed => "COMPLETED",
            Phase::Cancelled => "CANCELLED",
            Phase::Disputed => "DISPUTED",
            Phase::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The externally owned account fields the engine reads and writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub player_id: PlayerId,
    pub rep: u32,
    pub win_streak: u32,
    pub wins: u32,
    pub losses: u32,
    pub region: Region,
    /// Time of the last completed match, `None` for players who never finished one
    pub last_match_at: Option<DateTime<Utc>>,
    /// Match whose outcome was last written to this profile
    #[serde(default)]
    pub last_match_id: Option<MatchId>,
    pub club_id: Option<ClubId>,
}

impl PlayerProfile {
    pub fn new(player_id: impl Into<PlayerId>, rep: u32, region: impl Into<Region>) -> Self {
        Self {
            player_id: player_id.into(),
            rep,
            win_streak: 0,
            wins: 0,
            losses: 0,
            region: region.into(),
            last_match_at: None,
            last_match_id: None,
            club_id: None,
        }
    }

    pub fn rank_tier(&self) -> RankTier {
        RankTier::for_rep(self.rep)
    }

    /// Fraction of completed matches won, 0.5 for players with no history.
    pub fn win_rate(&self) -> f64 {
        let played = self.wins + self.losses;
        if played == 0 {
            0.5
        } else {
            self.wins as f64 / played as f64
        }
    }
}

/// A player waiting for a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub player_id: PlayerId,
    pub region: Region,
    pub rep: u32,
    pub rank_tier: RankTier,
    pub win_streak: u32,
    pub win_rate: f64,
    pub joined_at: DateTime<Utc>,
    pub match_attempts: u32,
}

/// Snapshot of a participant's standing when the match was created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSlot {
    pub player_id: PlayerId,
    pub rep: u32,
    pub rank_tier: RankTier,
    pub region: Region,
    pub win_streak: u32,
    pub queued_at: DateTime<Utc>,
    pub club_id: Option<ClubId>,
    pub reported_score: Option<u32>,
}

/// One stage removed from the pool during STAGE_SELECT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBan {
    pub player_id: PlayerId,
    pub stage: String,
    /// True when the engine banned on the player's behalf after a deadline
    pub automatic: bool,
}

/// A change of rank tier caused by an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankChange {
    pub from: RankTier,
    pub to: RankTier,
}

impl RankChange {
    pub fn is_promotion(&self) -> bool {
        self.to > self.from
    }
}

/// Club rep forwarded to the club league collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClubRepTransfer {
    pub winner_club: ClubId,
    pub loser_club: ClubId,
    pub winner_club_delta: i32,
    pub loser_club_delta: i32,
}

/// Result of an agreed score, embedded in the completed match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub winner_id: PlayerId,
    pub loser_id: PlayerId,
    pub winner_score: u32,
    pub loser_score: u32,
    pub winner_rep_delta: i32,
    pub loser_rep_delta: i32,
    pub hypercharged: bool,
    pub club_rep: Option<ClubRepTransfer>,
    #[serde(default)]
    pub winner_rank_change: Option<RankChange>,
    #[serde(default)]
    pub loser_rank_change: Option<RankChange>,
}

/// A 1v1 ranked match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub match_id: MatchId,
    pub participants: [ParticipantSlot; 2],
    pub phase: Phase,
    pub phase_started_at: DateTime<Utc>,
    pub phase_deadline: Option<DateTime<Utc>>,
    /// Stages offered at creation; the remaining pool is this minus the bans
    pub stage_pool: Vec<String>,
    pub stage_bans: Vec<StageBan>,
    /// Index into `participants` of the player who bans next
    pub ban_turn: usize,
    pub selected_stage: Option<String>,
    pub captain_picks: BTreeMap<PlayerId, String>,
    pub host_id: Option<PlayerId>,
    pub room_code: Option<String>,
    pub is_hypercharged: bool,
    pub created_at: DateTime<Utc>,
    pub terminal_reason: Option<String>,
    pub outcome: Option<MatchOutcome>,
    /// Set while a committed outcome has not reached both profiles yet
    #[serde(default)]
    pub outcome_pending: bool,
    /// Write counter checked by every compare-and-swap
    pub version: u64,
}

impl Match {
    pub fn participant(&self, player_id: &str) -> Option<&ParticipantSlot> {
        self.participants.iter().find(|p| p.player_id == player_id)
    }

    pub fn participant_index(&self, player_id: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.player_id == player_id)
    }

    pub fn has_participant(&self, player_id: &str) -> bool {
        self.participant_index(player_id).is_some()
    }

    pub fn opponent_of(&self, player_id: &str) -> Option<&ParticipantSlot> {
        self.participant_index(player_id)
            .map(|idx| &self.participants[1 - idx])
    }

    pub fn player_ids(&self) -> [PlayerId; 2] {
        [
            self.participants[0].player_id.clone(),
            self.participants[1].player_id.clone(),
        ]
    }

    pub fn remaining_stages(&self) -> Vec<String> {
        self.stage_pool
            .iter()
            .filter(|stage| !self.stage_bans.iter().any(|ban| &ban.stage == *stage))
            .cloned()
            .collect()
    }
}

/// A participant's claim about the final score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub match_id: MatchId,
    pub reporter_id: PlayerId,
    pub claimed_self_score: u32,
    pub claimed_opponent_score: u32,
    pub reported_at: DateTime<Utc>,
    pub reminder_sent: bool,
}

impl ScoreReport {
    /// Two reports agree when each one's self score is the other's opponent score.
    pub fn agrees_with(&self, other: &ScoreReport) -> bool {
        self.claimed_self_score == other.claimed_opponent_score
            && self.claimed_opponent_score == other.claimed_self_score
    }
}

/// Disagreeing reports, handed to external adjudication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub dispute_id: Uuid,
    pub match_id: MatchId,
    pub reports: [ScoreReport; 2],
    pub opened_at: DateTime<Utc>,
}

/// Kind of a notification sent to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    MatchFound,
    PhaseAdvanced,
    StageBanned,
    CaptainPicked,
    AwaitingOpponent,
    Reminder,
    DisputeOpened,
    MatchComplete,
    RankUp,
    RankDown,
    MatchCancelled,
    MatchFailed,
    QueueExpired,
    CommandRejected,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::MatchFound => "match_found",
            NotificationKind::PhaseAdvanced => "phase_advanced",
            NotificationKind::StageBanned => "stage_banned",
            NotificationKind::CaptainPicked => "captain_picked",
            NotificationKind::AwaitingOpponent => "awaiting_opponent",
            NotificationKind::Reminder => "reminder",
            NotificationKind::DisputeOpened => "dispute_opened",
            NotificationKind::MatchComplete => "match_complete",
            NotificationKind::RankUp => "rank_up",
            NotificationKind::RankDown => "rank_down",
            NotificationKind::MatchCancelled => "match_cancelled",
            NotificationKind::MatchFailed => "match_failed",
            NotificationKind::QueueExpired => "queue_expired",
            NotificationKind::CommandRejected => "command_rejected",
        }
    }
}

/// Message for the presentation layer to render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: PlayerId,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        recipient_id: impl Into<PlayerId>,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Same notification for both participants of a match.
    pub fn to_both(
        m: &Match,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Vec<Notification> {
        m.participants
            .iter()
            .map(|p| Notification::new(p.player_id.clone(), kind, payload.clone()))
            .collect()
    }
}
