//! Document store interface
//!
//! The engine is written against this trait rather than a concrete database.
//! Implementations must provide two guarantees the engine relies on:
//!
//! - [`DocumentStore::promote_pair`] removes both queue entries and inserts the
//!   match as one unit: either everything happens or nothing does.
//! - [`DocumentStore::compare_and_swap_match`] only writes when the stored
//!   phase and version both match what the caller read.

pub mod memory;

pub use memory::InMemoryDocumentStore;

use crate::error::Result;
use crate::types::{
    Dispute, Match, MatchId, Phase, PlayerId, PlayerProfile, QueueEntry, ScoreReport,
};
use async_trait::async_trait;
use uuid::Uuid;

/// Counts used by health checks and metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub queue_entries: usize,
    pub open_matches: usize,
    pub total_matches: usize,
    pub pending_reports: usize,
    pub disputes: usize,
}

/// Persistence operations for queue entries, matches, reports, disputes and profiles
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a queue entry. Fails with `AlreadyQueued` if the player has an
    /// entry, or `AlreadyInMatch` if they have a non-terminal match.
    async fn insert_queue_entry(&self, entry: QueueEntry) -> Result<()>;

    async fn remove_queue_entry(&self, player_id: &str) -> Result<Option<QueueEntry>>;

    async fn get_queue_entry(&self, player_id: &str) -> Result<Option<QueueEntry>>;

    /// All queue entries ordered by join time, oldest first
    async fn list_queue_entries(&self) -> Result<Vec<QueueEntry>>;

    /// Bump the attempt counter of each listed entry that still exists
    async fn increment_match_attempts(&self, player_ids: &[PlayerId]) -> Result<()>;

    /// Atomically remove both players' queue entries and insert `new_match`.
    /// Fails without side effects if either entry is gone.
    async fn promote_pair(&self, new_match: Match) -> Result<()>;

    async fn get_match(&self, match_id: MatchId) -> Result<Option<Match>>;

    /// The player's non-terminal match, if any
    async fn active_match_for_player(&self, player_id: &str) -> Result<Option<Match>>;

    async fn list_open_matches(&self) -> Result<Vec<Match>>;

    async fn list_matches(&self) -> Result<Vec<Match>>;

    /// Replace the stored match if its phase is `expected_phase` and its
    /// version is `expected_version`. The stored copy gets version + 1 and is
    /// returned. Fails with `StateConflict` otherwise.
    async fn compare_and_swap_match(
        &self,
        expected_phase: Phase,
        expected_version: u64,
        updated: Match,
    ) -> Result<Match>;

    /// Insert or replace the report keyed by (match, reporter)
    async fn upsert_score_report(&self, report: ScoreReport) -> Result<()>;

    async fn score_reports_for_match(&self, match_id: MatchId) -> Result<Vec<ScoreReport>>;

    async fn list_score_reports(&self) -> Result<Vec<ScoreReport>>;

    /// Flag a report's reminder as sent. Returns false if it was already set
    /// or the report no longer exists.
    async fn mark_reminder_sent(&self, match_id: MatchId, reporter_id: &str) -> Result<bool>;

    async fn delete_score_reports(&self, match_id: MatchId) -> Result<usize>;

    /// Record a dispute. Fails if the match already has one.
    async fn insert_dispute(&self, dispute: Dispute) -> Result<()>;

    /// Drop a dispute whose match never reached DISPUTED
    async fn remove_dispute(&self, dispute_id: Uuid) -> Result<bool>;

    async fn list_disputes(&self) -> Result<Vec<Dispute>>;

    async fn get_profile(&self, player_id: &str) -> Result<Option<PlayerProfile>>;

    async fn upsert_profile(&self, profile: PlayerProfile) -> Result<()>;

    async fn counts(&self) -> Result<StoreCounts>;
}
