//! In-memory document store
//!
//! Every collection lives behind one lock, so multi-collection operations
//! such as queue promotion are naturally all-or-nothing. The lock is never
//! held across an await point.

use crate::error::{EngineError, Result};
use crate::store::{DocumentStore, StoreCounts};
use crate::types::{
    Dispute, Match, MatchId, Phase, PlayerId, PlayerProfile, QueueEntry, ScoreReport,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoreState {
    queue_entries: HashMap<PlayerId, QueueEntry>,
    matches: HashMap<MatchId, Match>,
    /// Player -> non-terminal match, kept in sync with `matches`
    active_matches: HashMap<PlayerId, MatchId>,
    score_reports: HashMap<(MatchId, PlayerId), ScoreReport>,
    disputes: Vec<Dispute>,
    profiles: HashMap<PlayerId, PlayerProfile>,
}

/// Document store backed by in-process hash maps
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    state: RwLock<StoreState>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with player profiles
    pub fn with_profiles(profiles: impl IntoIterator<Item = PlayerProfile>) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.write() {
            for profile in profiles {
                state.profiles.insert(profile.player_id.clone(), profile);
            }
        }
        store
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state.read().map_err(|_| EngineError::Storage {
            message: "Failed to acquire store read lock".to_string(),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state.write().map_err(|_| EngineError::Storage {
            message: "Failed to acquire store write lock".to_string(),
        })
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_queue_entry(&self, entry: QueueEntry) -> Result<()> {
        let mut state = self.write()?;

        if state.queue_entries.contains_key(&entry.player_id) {
            return Err(EngineError::AlreadyQueued {
                player_id: entry.player_id,
            });
        }
        if let Some(match_id) = state.active_matches.get(&entry.player_id) {
            return Err(EngineError::AlreadyInMatch {
                player_id: entry.player_id.clone(),
                match_id: *match_id,
            });
        }

        state.queue_entries.insert(entry.player_id.clone(), entry);
        Ok(())
    }

    async fn remove_queue_entry(&self, player_id: &str) -> Result<Option<QueueEntry>> {
        let mut state = self.write()?;
        Ok(state.queue_entries.remove(player_id))
    }

    async fn get_queue_entry(&self, player_id: &str) -> Result<Option<QueueEntry>> {
        let state = self.read()?;
        Ok(state.queue_entries.get(player_id).cloned())
    }

    async fn list_queue_entries(&self) -> Result<Vec<QueueEntry>> {
        let state = self.read()?;
        let mut entries: Vec<QueueEntry> = state.queue_entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.player_id.cmp(&b.player_id))
        });
        Ok(entries)
    }

    async fn increment_match_attempts(&self, player_ids: &[PlayerId]) -> Result<()> {
        let mut state = self.write()?;
        for player_id in player_ids {
            if let Some(entry) = state.queue_entries.get_mut(player_id) {
                entry.match_attempts += 1;
            }
        }
        Ok(())
    }

    async fn promote_pair(&self, new_match: Match) -> Result<()> {
        let mut state = self.write()?;
        let [first, second] = new_match.player_ids();

        if first == second {
            return Err(EngineError::validation("A match needs two distinct players"));
        }
        for player_id in [&first, &second] {
            if !state.queue_entries.contains_key(player_id) {
                return Err(EngineError::NotQueued {
                    player_id: player_id.clone(),
                });
            }
            if let Some(match_id) = state.active_matches.get(player_id) {
                return Err(EngineError::AlreadyInMatch {
                    player_id: player_id.clone(),
                    match_id: *match_id,
                });
            }
        }

        state.queue_entries.remove(&first);
        state.queue_entries.remove(&second);
        state.active_matches.insert(first, new_match.match_id);
        state.active_matches.insert(second, new_match.match_id);
        debug!("Stored new match {}", new_match.match_id);
        state.matches.insert(new_match.match_id, new_match);
        Ok(())
    }

    async fn get_match(&self, match_id: MatchId) -> Result<Option<Match>> {
        let state = self.read()?;
        Ok(state.matches.get(&match_id).cloned())
    }

    async fn active_match_for_player(&self, player_id: &str) -> Result<Option<Match>> {
        let state = self.read()?;
        Ok(state
            .active_matches
            .get(player_id)
            .and_then(|match_id| state.matches.get(match_id))
            .cloned())
    }

    async fn list_open_matches(&self) -> Result<Vec<Match>> {
        let state = self.read()?;
        let mut matches: Vec<Match> = state
            .matches
            .values()
            .filter(|m| !m.phase.is_terminal())
            .cloned()
            .collect();
        matches.sort_by_key(|m| m.created_at);
        Ok(matches)
    }

    async fn list_matches(&self) -> Result<Vec<Match>> {
        let state = self.read()?;
        let mut matches: Vec<Match> = state.matches.values().cloned().collect();
        matches.sort_by_key(|m| m.created_at);
        Ok(matches)
    }

    async fn compare_and_swap_match(
        &self,
        expected_phase: Phase,
        expected_version: u64,
        mut updated: Match,
    ) -> Result<Match> {
        let mut state = self.write()?;
        let match_id = updated.match_id;

        let stored = state
            .matches
            .get(&match_id)
            .ok_or(EngineError::MatchNotFound { match_id })?;

        if stored.phase != expected_phase || stored.version != expected_version {
            return Err(EngineError::StateConflict {
                match_id,
                expected: expected_phase,
                actual: stored.phase,
            });
        }

        updated.version = expected_version + 1;
        if updated.phase.is_terminal() {
            for player_id in updated.player_ids() {
                if state.active_matches.get(&player_id) == Some(&match_id) {
                    state.active_matches.remove(&player_id);
                }
            }
        }
        state.matches.insert(match_id, updated.clone());
        Ok(updated)
    }

    async fn upsert_score_report(&self, report: ScoreReport) -> Result<()> {
        let mut state = self.write()?;
        state
            .score_reports
            .insert((report.match_id, report.reporter_id.clone()), report);
        Ok(())
    }

    async fn score_reports_for_match(&self, match_id: MatchId) -> Result<Vec<ScoreReport>> {
        let state = self.read()?;
        let mut reports: Vec<ScoreReport> = state
            .score_reports
            .values()
            .filter(|r| r.match_id == match_id)
            .cloned()
            .collect();
        reports.sort_by_key(|r| r.reported_at);
        Ok(reports)
    }

    async fn list_score_reports(&self) -> Result<Vec<ScoreReport>> {
        let state = self.read()?;
        Ok(state.score_reports.values().cloned().collect())
    }

    async fn mark_reminder_sent(&self, match_id: MatchId, reporter_id: &str) -> Result<bool> {
        let mut state = self.write()?;
        match state
            .score_reports
            .get_mut(&(match_id, reporter_id.to_string()))
        {
            Some(report) if !report.reminder_sent => {
                report.reminder_sent = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_score_reports(&self, match_id: MatchId) -> Result<usize> {
        let mut state = self.write()?;
        let before = state.score_reports.len();
        state.score_reports.retain(|(id, _), _| *id != match_id);
        Ok(before - state.score_reports.len())
    }

    async fn insert_dispute(&self, dispute: Dispute) -> Result<()> {
        let mut state = self.write()?;
        if state.disputes.iter().any(|d| d.match_id == dispute.match_id) {
            return Err(EngineError::validation(format!(
                "Match {} already has a dispute",
                dispute.match_id
            )));
        }
        state.disputes.push(dispute);
        Ok(())
    }

    async fn remove_dispute(&self, dispute_id: Uuid) -> Result<bool> {
        let mut state = self.write()?;
        let before = state.disputes.len();
        state.disputes.retain(|d| d.dispute_id != dispute_id);
        Ok(state.disputes.len() < before)
    }

    async fn list_disputes(&self) -> Result<Vec<Dispute>> {
        let state = self.read()?;
        Ok(state.disputes.clone())
    }

    async fn get_profile(&self, player_id: &str) -> Result<Option<PlayerProfile>> {
        let state = self.read()?;
        Ok(state.profiles.get(player_id).cloned())
    }

    async fn upsert_profile(&self, profile: PlayerProfile) -> Result<()> {
        let mut state = self.write()?;
        state.profiles.insert(profile.player_id.clone(), profile);
        Ok(())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let state = self.read()?;
        Ok(StoreCounts {
            queue_entries: state.queue_entries.len(),
            open_matches: state
                .matches
                .values()
                .filter(|m| !m.phase.is_terminal())
                .count(),
            total_matches: state.matches.len(),
            pending_reports: state.score_reports.len(),
            disputes: state.disputes.len(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{ParticipantSlot, RankTier};
    use chrono::Utc;
    use std::collections::BTreeMap;

    pub(crate) fn entry(player_id: &str, rep: u32) -> QueueEntry {
        QueueEntry {
            player_id: player_id.to_string(),
            region: "NA".to_string(),
            rep,
            rank_tier: RankTier::for_rep(rep),
            win_streak: 0,
            win_rate: 0.5,
            joined_at: Utc::now(),
            match_attempts: 0,
        }
    }

    pub(crate) fn slot(entry: &QueueEntry) -> ParticipantSlot {
        ParticipantSlot {
            player_id: entry.player_id.clone(),
            rep: entry.rep,
            rank_tier: entry.rank_tier,
            region: entry.region.clone(),
            win_streak: entry.win_streak,
            queued_at: entry.joined_at,
            club_id: None,
            reported_score: None,
        }
    }

    pub(crate) fn new_match(a: &QueueEntry, b: &QueueEntry) -> Match {
        let now = Utc::now();
        Match {
            match_id: crate::utils::generate_match_id(),
            participants: [slot(a), slot(b)],
            phase: Phase::Pregame,
            phase_started_at: now,
            phase_deadline: None,
            stage_pool: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            stage_bans: Vec::new(),
            ban_turn: 0,
            selected_stage: None,
            captain_picks: BTreeMap::new(),
            host_id: None,
            room_code: None,
            is_hypercharged: false,
            created_at: now,
            terminal_reason: None,
            outcome: None,
            outcome_pending: false,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_queue_entry_uniqueness() {
        let store = InMemoryDocumentStore::new();
        store.insert_queue_entry(entry("p1", 1000)).await.unwrap();

        let err = store.insert_queue_entry(entry("p1", 1000)).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyQueued { .. }));
    }

    #[tokio::test]
    async fn test_promote_pair_moves_players_atomically() {
        let store = InMemoryDocumentStore::new();
        let a = entry("a", 1000);
        let b = entry("b", 1050);
        store.insert_queue_entry(a.clone()).await.unwrap();
        store.insert_queue_entry(b.clone()).await.unwrap();

        let m = new_match(&a, &b);
        store.promote_pair(m.clone()).await.unwrap();

        assert!(store.get_queue_entry("a").await.unwrap().is_none());
        assert!(store.get_queue_entry("b").await.unwrap().is_none());
        let active = store.active_match_for_player("a").await.unwrap().unwrap();
        assert_eq!(active.match_id, m.match_id);

        // A player in a match cannot queue again.
        let err = store.insert_queue_entry(entry("b", 1050)).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyInMatch { .. }));
    }

    #[tokio::test]
    async fn test_promote_pair_aborts_when_entry_missing() {
        let store = InMemoryDocumentStore::new();
        let a = entry("a", 1000);
        let b = entry("b", 1050);
        store.insert_queue_entry(a.clone()).await.unwrap();

        let err = store.promote_pair(new_match(&a, &b)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotQueued { ref player_id } if player_id == "b"));

        // Nothing changed.
        assert!(store.get_queue_entry("a").await.unwrap().is_some());
        assert!(store.active_match_for_player("a").await.unwrap().is_none());
        assert_eq!(store.counts().await.unwrap().total_matches, 0);
    }

    #[tokio::test]
    async fn test_compare_and_swap_checks_phase_and_version() {
        let store = InMemoryDocumentStore::new();
        let a = entry("a", 1000);
        let b = entry("b", 1000);
        store.insert_queue_entry(a.clone()).await.unwrap();
        store.insert_queue_entry(b.clone()).await.unwrap();
        let m = new_match(&a, &b);
        store.promote_pair(m.clone()).await.unwrap();

        let mut next = m.clone();
        next.phase = Phase::StageSelect;
        let stored = store
            .compare_and_swap_match(Phase::Pregame, 0, next.clone())
            .await
            .unwrap();
        assert_eq!(stored.version, 1);

        // Stale phase
        let err = store
            .compare_and_swap_match(Phase::Pregame, 1, next.clone())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::StateConflict {
                match_id: m.match_id,
                expected: Phase::Pregame,
                actual: Phase::StageSelect
            }
        );

        // Stale version, same phase
        let err = store
            .compare_and_swap_match(Phase::StageSelect, 0, next)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_terminal_match_releases_players() {
        let store = InMemoryDocumentStore::new();
        let a = entry("a", 1000);
        let b = entry("b", 1000);
        store.insert_queue_entry(a.clone()).await.unwrap();
        store.insert_queue_entry(b.clone()).await.unwrap();
        let m = new_match(&a, &b);
        store.promote_pair(m.clone()).await.unwrap();

        let mut failed = m.clone();
        failed.phase = Phase::Failed;
        store
            .compare_and_swap_match(Phase::Pregame, 0, failed)
            .await
            .unwrap();

        assert!(store.active_match_for_player("a").await.unwrap().is_none());
        assert!(store.insert_queue_entry(entry("a", 1000)).await.is_ok());
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.open_matches, 0);
        assert_eq!(counts.total_matches, 1);
    }

    #[tokio::test]
    async fn test_reminder_flag_set_once() {
        let store = InMemoryDocumentStore::new();
        let match_id = crate::utils::generate_match_id();
        store
            .upsert_score_report(ScoreReport {
                match_id,
                reporter_id: "a".to_string(),
                claimed_self_score: 3,
                claimed_opponent_score: 1,
                reported_at: Utc::now(),
                reminder_sent: false,
            })
            .await
            .unwrap();

        assert!(store.mark_reminder_sent(match_id, "a").await.unwrap());
        assert!(!store.mark_reminder_sent(match_id, "a").await.unwrap());
        assert!(!store.mark_reminder_sent(match_id, "b").await.unwrap());
        assert_eq!(store.delete_score_reports(match_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_one_dispute_per_match() {
        let store = InMemoryDocumentStore::new();
        let match_id = crate::utils::generate_match_id();
        let report = |reporter: &str| ScoreReport {
            match_id,
            reporter_id: reporter.to_string(),
            claimed_self_score: 5,
            claimed_opponent_score: 2,
            reported_at: Utc::now(),
            reminder_sent: false,
        };
        let dispute = |dispute_id| Dispute {
            dispute_id,
            match_id,
            reports: [report("a"), report("b")],
            opened_at: Utc::now(),
        };

        let first = crate::utils::generate_dispute_id();
        store.insert_dispute(dispute(first)).await.unwrap();
        let err = store
            .insert_dispute(dispute(crate::utils::generate_dispute_id()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        assert!(store.remove_dispute(first).await.unwrap());
        assert!(!store.remove_dispute(first).await.unwrap());
        assert!(store.list_disputes().await.unwrap().is_empty());
    }
}
