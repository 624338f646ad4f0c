//! Match phase state machine
//!
//! Every write goes through [`PhaseMachine::mutate`], which re-reads the
//! match, applies a pure update and stores it with a phase + version
//! compare-and-swap. Lost version races are retried with doubling backoff;
//! a phase that moved on underneath the caller is reported as a
//! `StateConflict` straight away.

use crate::amqp::publisher::{publish_all, NotificationPublisher};
use crate::clock::Clock;
use crate::config::{CancellationPolicy, PhaseConfig};
use crate::error::{EngineError, Result};
use crate::metrics::MetricsCollector;
use crate::phase::graph;
use crate::queue::QueueManager;
use crate::store::DocumentStore;
use crate::types::{
    Match, MatchId, Notification, NotificationKind, ParticipantSlot, Phase, StageBan,
};
use crate::utils::normalize_room_code;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// A committed match write
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub before: Match,
    pub after: Match,
}

impl Transition {
    pub fn phase_changed(&self) -> bool {
        self.before.phase != self.after.phase
    }
}

/// Result of one deadline sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadlineReport {
    /// Timeout actions applied
    pub expired: usize,
    /// Matches whose deadline moved or phase changed before the action landed
    pub skipped: usize,
    /// Matches failed because the timeout action kept losing races
    pub failed: usize,
    pub errors: usize,
}

/// Drives matches from PREGAME to a terminal phase
pub struct PhaseMachine {
    store: Arc<dyn DocumentStore>,
    publisher: Arc<dyn NotificationPublisher>,
    clock: Arc<dyn Clock>,
    config: PhaseConfig,
    queue: QueueManager,
    metrics: Arc<MetricsCollector>,
}

impl PhaseMachine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        publisher: Arc<dyn NotificationPublisher>,
        clock: Arc<dyn Clock>,
        config: PhaseConfig,
        queue: QueueManager,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
            queue,
            metrics,
        }
    }

    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }

    pub async fn load(&self, match_id: MatchId) -> Result<Match> {
        self.store
            .get_match(match_id)
            .await?
            .ok_or(EngineError::MatchNotFound { match_id })
    }

    /// Apply `update` to the stored match if it is in `expected` phase.
    ///
    /// `update` receives the freshly read match and the current time and
    /// returns the replacement, or `None` to leave the match untouched. It
    /// may run more than once, so it must not have side effects. Phase
    /// changes are checked against the transition graph.
    pub async fn mutate<F>(
        &self,
        match_id: MatchId,
        expected: Phase,
        mut update: F,
    ) -> Result<Option<Transition>>
    where
        F: FnMut(&Match, DateTime<Utc>) -> Result<Option<Match>> + Send,
    {
        let mut attempt: u32 = 0;
        loop {
            let current = self.load(match_id).await?;
            if current.phase != expected {
                return Err(EngineError::StateConflict {
                    match_id,
                    expected,
                    actual: current.phase,
                });
            }

            let updated = match update(&current, self.clock.now())? {
                Some(updated) => updated,
                None => return Ok(None),
            };
            if updated.phase != current.phase && !graph::is_legal(current.phase, updated.phase) {
                return Err(EngineError::InvalidTransition {
                    match_id,
                    from: current.phase,
                    to: updated.phase,
                });
            }

            match self
                .store
                .compare_and_swap_match(expected, current.version, updated)
                .await
            {
                Ok(after) => {
                    return Ok(Some(Transition {
                        before: current,
                        after,
                    }))
                }
                Err(EngineError::StateConflict { actual, .. })
                    if actual == expected && attempt < self.config.max_transition_retries =>
                {
                    self.metrics.record_transition_conflict();
                    let delay = self
                        .config
                        .retry_base_delay_ms
                        .saturating_mul(1u64 << attempt.min(16));
                    debug!(
                        "Match {} write lost a version race, retrying in {}ms (attempt {})",
                        match_id,
                        delay,
                        attempt + 1
                    );
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.metrics.record_transition_conflict();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Move a match along one edge of the transition graph.
    ///
    /// COMPLETED and DISPUTED are only reached through score reports, and a
    /// negotiation phase can only be left once its own choice is recorded.
    pub async fn transition_to(
        &self,
        match_id: MatchId,
        expected: Phase,
        next: Phase,
        reason: &str,
    ) -> Result<Match> {
        let config = &self.config;
        let transition = self
            .mutate(match_id, expected, |current, now| {
                if !graph::is_legal(current.phase, next) {
                    return Err(EngineError::InvalidTransition {
                        match_id,
                        from: current.phase,
                        to: next,
                    });
                }
                check_exit(current, next)?;
                let mut updated = current.clone();
                enter_phase(config, &mut updated, next, now);
                if next.is_terminal() {
                    updated.terminal_reason = Some(reason.to_string());
                }
                Ok(Some(updated))
            })
            .await?;
        self.finish(match_id, transition).await
    }

    pub async fn submit_stage_ban(
        &self,
        match_id: MatchId,
        player_id: &str,
        stage: &str,
    ) -> Result<Match> {
        let config = &self.config;
        let transition = self
            .mutate(match_id, Phase::StageSelect, |current, now| {
                let idx = slot_of(current, player_id)?;
                if idx != current.ban_turn {
                    return Err(EngineError::NotYourTurn {
                        match_id,
                        player_id: player_id.to_string(),
                    });
                }
                let banned = current
                    .remaining_stages()
                    .into_iter()
                    .find(|s| s.eq_ignore_ascii_case(stage.trim()))
                    .ok_or_else(|| {
                        EngineError::validation(format!("Stage '{}' is not available", stage))
                    })?;

                let mut updated = current.clone();
                apply_ban(config, &mut updated, idx, banned, false, now);
                Ok(Some(updated))
            })
            .await?;
        self.finish(match_id, transition).await
    }

    pub async fn submit_captain_pick(
        &self,
        match_id: MatchId,
        player_id: &str,
        captain: &str,
    ) -> Result<Match> {
        let config = &self.config;
        let transition = self
            .mutate(match_id, Phase::CaptainSelect, |current, now| {
                slot_of(current, player_id)?;
                if current.captain_picks.contains_key(player_id) {
                    return Err(EngineError::validation(format!(
                        "Player {} already picked a captain",
                        player_id
                    )));
                }
                let picked = config
                    .captains
                    .iter()
                    .find(|c| c.eq_ignore_ascii_case(captain.trim()))
                    .ok_or_else(|| {
                        EngineError::validation(format!("Unknown captain '{}'", captain))
                    })?;

                let mut updated = current.clone();
                updated
                    .captain_picks
                    .insert(player_id.to_string(), picked.clone());
                if updated.captain_picks.len() == updated.participants.len() {
                    enter_phase(config, &mut updated, Phase::HostSelect, now);
                }
                Ok(Some(updated))
            })
            .await?;
        self.finish(match_id, transition).await
    }

    /// First participant to volunteer becomes host
    pub async fn submit_host_choice(&self, match_id: MatchId, player_id: &str) -> Result<Match> {
        let config = &self.config;
        let transition = self
            .mutate(match_id, Phase::HostSelect, |current, now| {
                slot_of(current, player_id)?;
                let mut updated = current.clone();
                updated.host_id = Some(player_id.to_string());
                enter_phase(config, &mut updated, Phase::RoomCode, now);
                Ok(Some(updated))
            })
            .await?;
        self.finish(match_id, transition).await
    }

    pub async fn submit_room_code(
        &self,
        match_id: MatchId,
        host_id: &str,
        code: &str,
    ) -> Result<Match> {
        let config = &self.config;
        let transition = self
            .mutate(match_id, Phase::RoomCode, |current, now| {
                slot_of(current, host_id)?;
                if current.host_id.as_deref() != Some(host_id) {
                    return Err(EngineError::validation(format!(
                        "Only the host can submit the room code for match {}",
                        match_id
                    )));
                }
                let code = normalize_room_code(code).ok_or_else(|| {
                    EngineError::validation("Room code must be 1-12 letters or digits")
                })?;

                let mut updated = current.clone();
                updated.room_code = Some(code);
                enter_phase(config, &mut updated, Phase::Active, now);
                Ok(Some(updated))
            })
            .await?;
        self.finish(match_id, transition).await
    }

    /// Cancel a match that reached ROOM_CODE or ACTIVE
    pub async fn cancel_match(&self, match_id: MatchId, reason: &str) -> Result<Match> {
        let current = self.load(match_id).await?;
        if !matches!(current.phase, Phase::RoomCode | Phase::Active) {
            return Err(EngineError::InvalidTransition {
                match_id,
                from: current.phase,
                to: Phase::Cancelled,
            });
        }
        self.transition_to(match_id, current.phase, Phase::Cancelled, reason)
            .await
    }

    /// Move a match to FAILED from whatever non-terminal phase it is in
    pub async fn fail_match(&self, match_id: MatchId, reason: &str) -> Result<Match> {
        let current = self.load(match_id).await?;
        warn!("Failing match {} in {}: {}", match_id, current.phase, reason);
        self.transition_to(match_id, current.phase, Phase::Failed, reason)
            .await
    }

    /// Apply the timeout action of every open match whose deadline passed
    pub async fn run_deadline_sweep(&self) -> Result<DeadlineReport> {
        let now = self.clock.now();
        let mut report = DeadlineReport::default();

        for m in self.store.list_open_matches().await? {
            match m.phase_deadline {
                Some(deadline) if deadline <= now => {}
                _ => continue,
            }

            match self.expire(m.match_id, m.phase).await {
                Ok(true) => report.expired += 1,
                Ok(false) => report.skipped += 1,
                Err(EngineError::StateConflict {
                    expected, actual, ..
                }) if expected == actual => {
                    let reason = format!("{} timeout lost every write attempt", m.phase);
                    match self.fail_match(m.match_id, &reason).await {
                        Ok(_) => report.failed += 1,
                        Err(e) => {
                            error!("Could not fail match {}: {}", m.match_id, e);
                            report.errors += 1;
                        }
                    }
                }
                Err(EngineError::StateConflict { actual, .. }) => {
                    debug!(
                        "Match {} left {} before its timeout applied (now {})",
                        m.match_id, m.phase, actual
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    error!("Timeout handling for match {} failed: {}", m.match_id, e);
                    report.errors += 1;
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            info!(
                "Deadline sweep: {} expired, {} failed, {} skipped",
                report.expired, report.failed, report.skipped
            );
        }
        Ok(report)
    }

    async fn expire(&self, match_id: MatchId, phase: Phase) -> Result<bool> {
        let config = &self.config;
        let transition = self
            .mutate(match_id, phase, |current, now| {
                match current.phase_deadline {
                    Some(deadline) if deadline <= now => Ok(timeout_action(config, current, now)),
                    _ => Ok(None),
                }
            })
            .await?;

        match transition {
            Some(transition) => {
                self.metrics.record_phase_timeout(phase);
                debug!("Match {} timed out in {}", match_id, phase);
                self.announce(&transition).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finish(&self, match_id: MatchId, transition: Option<Transition>) -> Result<Match> {
        let transition = transition.ok_or_else(|| {
            EngineError::internal(format!("Update of match {} produced no change", match_id))
        })?;
        self.announce(&transition).await;
        Ok(transition.after)
    }

    /// Metrics, side effects and notifications for a committed write
    async fn announce(&self, transition: &Transition) {
        let (before, after) = (&transition.before, &transition.after);
        let mut notifications = action_notifications(before, after);

        if transition.phase_changed() {
            self.metrics
                .record_phase_transition(before.phase, after.phase);
            info!(
                "Match {}: {} -> {}{}",
                after.match_id,
                before.phase,
                after.phase,
                after
                    .terminal_reason
                    .as_deref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            );

            if matches!(after.phase, Phase::Cancelled | Phase::Failed) {
                if let Err(e) = self.store.delete_score_reports(after.match_id).await {
                    warn!(
                        "Failed to clear score reports of match {}: {}",
                        after.match_id, e
                    );
                }
            }

            let requeue = after.phase == Phase::Cancelled
                && self.config.cancellation_policy == CancellationPolicy::Requeue;
            if requeue {
                for slot in &after.participants {
                    if let Err(e) = self.queue.requeue(&slot.player_id, &slot.region).await {
                        warn!("Could not requeue '{}': {}", slot.player_id, e);
                    }
                }
            }

            notifications.extend(phase_notifications(before, after, requeue));
        }

        publish_all(self.publisher.as_ref(), notifications).await;
    }
}

/// Set a new phase and its deadline
pub(crate) fn enter_phase(config: &PhaseConfig, m: &mut Match, phase: Phase, now: DateTime<Utc>) {
    m.phase = phase;
    m.phase_started_at = now;
    m.phase_deadline = config.phase_timeout(phase).map(|timeout| now + timeout);
}

/// Requirements a direct transition must meet before leaving the current phase
fn check_exit(current: &Match, next: Phase) -> Result<()> {
    let missing = match next {
        Phase::Completed | Phase::Disputed => {
            return Err(EngineError::validation(format!(
                "Match {} can only become {} through score reports",
                current.match_id, next
            )))
        }
        Phase::CaptainSelect if current.selected_stage.is_none() => "a selected stage",
        Phase::HostSelect if current.captain_picks.len() < current.participants.len() => {
            "a captain for both players"
        }
        Phase::RoomCode if current.host_id.is_none() => "a host",
        Phase::Active if current.room_code.is_none() => "a room code",
        _ => return Ok(()),
    };
    Err(EngineError::validation(format!(
        "Match {} cannot enter {} without {}",
        current.match_id, next, missing
    )))
}

fn slot_of(m: &Match, player_id: &str) -> Result<usize> {
    m.participant_index(player_id)
        .ok_or_else(|| EngineError::NotParticipant {
            match_id: m.match_id,
            player_id: player_id.to_string(),
        })
}

/// Record a ban for participant `idx`; the last remaining stage is selected
fn apply_ban(
    config: &PhaseConfig,
    m: &mut Match,
    idx: usize,
    stage: String,
    automatic: bool,
    now: DateTime<Utc>,
) {
    m.stage_bans.push(StageBan {
        player_id: m.participants[idx].player_id.clone(),
        stage,
        automatic,
    });

    let remaining = m.remaining_stages();
    if remaining.len() <= 1 {
        m.selected_stage = remaining.into_iter().next();
        enter_phase(config, m, Phase::CaptainSelect, now);
    } else {
        m.ban_turn = 1 - idx;
        m.phase_deadline = config
            .phase_timeout(Phase::StageSelect)
            .map(|timeout| now + timeout);
    }
}

/// Host chosen when nobody volunteers: higher rep, then earlier queue join
pub fn default_host(m: &Match) -> &ParticipantSlot {
    let [first, second] = &m.participants;
    if second.rep > first.rep || (second.rep == first.rep && second.queued_at < first.queued_at) {
        second
    } else {
        first
    }
}

fn timeout_action(config: &PhaseConfig, current: &Match, now: DateTime<Utc>) -> Option<Match> {
    let mut updated = current.clone();
    let mut rng = rand::thread_rng();

    match current.phase {
        Phase::Pregame => enter_phase(config, &mut updated, Phase::StageSelect, now),
        Phase::StageSelect => {
            let stage = current.remaining_stages().choose(&mut rng)?.clone();
            apply_ban(config, &mut updated, current.ban_turn, stage, true, now);
        }
        Phase::CaptainSelect => {
            for slot in &current.participants {
                if !updated.captain_picks.contains_key(&slot.player_id) {
                    let captain = config.captains.choose(&mut rng)?.clone();
                    updated.captain_picks.insert(slot.player_id.clone(), captain);
                }
            }
            enter_phase(config, &mut updated, Phase::HostSelect, now);
        }
        Phase::HostSelect => {
            updated.host_id = Some(default_host(current).player_id.clone());
            enter_phase(config, &mut updated, Phase::RoomCode, now);
        }
        Phase::RoomCode => {
            enter_phase(config, &mut updated, Phase::Cancelled, now);
            updated.terminal_reason = Some("room code was not submitted in time".to_string());
        }
        Phase::Active => {
            enter_phase(config, &mut updated, Phase::Cancelled, now);
            updated.terminal_reason = Some("match exceeded the active time limit".to_string());
        }
        _ => return None,
    }
    Some(updated)
}

/// StageBanned / CaptainPicked for whatever the write added
fn action_notifications(before: &Match, after: &Match) -> Vec<Notification> {
    let mut notifications = Vec::new();

    for ban in after.stage_bans.iter().skip(before.stage_bans.len()) {
        notifications.extend(Notification::to_both(
            after,
            NotificationKind::StageBanned,
            json!({
                "match_id": after.match_id,
                "player_id": ban.player_id,
                "stage": ban.stage,
                "automatic": ban.automatic,
                "remaining": after.remaining_stages(),
                "next_turn": after.participants[after.ban_turn].player_id,
            }),
        ));
    }

    for (player_id, captain) in &after.captain_picks {
        if !before.captain_picks.contains_key(player_id) {
            notifications.extend(Notification::to_both(
                after,
                NotificationKind::CaptainPicked,
                json!({
                    "match_id": after.match_id,
                    "player_id": player_id,
                    "captain": captain,
                }),
            ));
        }
    }

    notifications
}

fn phase_notifications(before: &Match, after: &Match, requeued: bool) -> Vec<Notification> {
    let (kind, payload) = match after.phase {
        Phase::Cancelled => (
            NotificationKind::MatchCancelled,
            json!({
                "match_id": after.match_id,
                "from": before.phase,
                "reason": after.terminal_reason,
                "requeued": requeued,
            }),
        ),
        Phase::Failed => (
            NotificationKind::MatchFailed,
            json!({
                "match_id": after.match_id,
                "from": before.phase,
                "reason": after.terminal_reason,
            }),
        ),
        _ => (
            NotificationKind::PhaseAdvanced,
            json!({
                "match_id": after.match_id,
                "from": before.phase,
                "to": after.phase,
                "phase_deadline": after.phase_deadline,
                "selected_stage": after.selected_stage,
                "captain_picks": after.captain_picks,
                "host_id": after.host_id,
                "room_code": after.room_code,
            }),
        ),
    };
    Notification::to_both(after, kind, payload)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::amqp::publisher::MockNotificationPublisher;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::store::memory::tests::{entry, new_match};
    use crate::store::{InMemoryDocumentStore, StoreCounts};
    use crate::types::{Dispute, PlayerId, PlayerProfile, QueueEntry, ScoreReport};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// A write another request commits while the caller is mid-operation
    pub(crate) type InterleavedWrite = Box<dyn FnOnce(&Match) -> Match + Send>;

    /// Delegating store that stages races and write failures.
    ///
    /// The first `conflicts` CAS calls lose a version race. An interleaved
    /// write is committed to the inner store just before the next CAS (or
    /// score report) is delegated, as if another request got there first.
    pub(crate) struct RacingStore {
        inner: InMemoryDocumentStore,
        conflicts: AtomicU32,
        before_cas: Mutex<Option<InterleavedWrite>>,
        before_report: Mutex<Option<InterleavedWrite>>,
        failing_profile_writes: AtomicU32,
        failing_dispute_inserts: AtomicU32,
    }

    impl RacingStore {
        pub(crate) fn new(inner: InMemoryDocumentStore, conflicts: u32) -> Self {
            Self {
                inner,
                conflicts: AtomicU32::new(conflicts),
                before_cas: Mutex::new(None),
                before_report: Mutex::new(None),
                failing_profile_writes: AtomicU32::new(0),
                failing_dispute_inserts: AtomicU32::new(0),
            }
        }

        pub(crate) fn interleave_before_cas(&self, write: InterleavedWrite) {
            *self.before_cas.lock().unwrap() = Some(write);
        }

        pub(crate) fn interleave_before_report(&self, write: InterleavedWrite) {
            *self.before_report.lock().unwrap() = Some(write);
        }

        pub(crate) fn fail_profile_writes(&self, count: u32) {
            self.failing_profile_writes.store(count, Ordering::SeqCst);
        }

        pub(crate) fn fail_dispute_inserts(&self, count: u32) {
            self.failing_dispute_inserts.store(count, Ordering::SeqCst);
        }

        async fn commit_interleaved(
            &self,
            slot: &Mutex<Option<InterleavedWrite>>,
            match_id: MatchId,
        ) {
            let write = slot.lock().unwrap().take();
            if let Some(write) = write {
                let current = self.inner.get_match(match_id).await.unwrap().unwrap();
                let (phase, version) = (current.phase, current.version);
                self.inner
                    .compare_and_swap_match(phase, version, write(&current))
                    .await
                    .unwrap();
            }
        }
    }

    fn take_failure(counter: &AtomicU32, what: &str) -> Result<()> {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Storage {
                message: format!("{} write rejected", what),
            });
        }
        Ok(())
    }

    #[async_trait]
    impl DocumentStore for RacingStore {
        async fn insert_queue_entry(&self, entry: QueueEntry) -> Result<()> {
            self.inner.insert_queue_entry(entry).await
        }
        async fn remove_queue_entry(&self, player_id: &str) -> Result<Option<QueueEntry>> {
            self.inner.remove_queue_entry(player_id).await
        }
        async fn get_queue_entry(&self, player_id: &str) -> Result<Option<QueueEntry>> {
            self.inner.get_queue_entry(player_id).await
        }
        async fn list_queue_entries(&self) -> Result<Vec<QueueEntry>> {
            self.inner.list_queue_entries().await
        }
        async fn increment_match_attempts(&self, player_ids: &[PlayerId]) -> Result<()> {
            self.inner.increment_match_attempts(player_ids).await
        }
        async fn promote_pair(&self, new_match: Match) -> Result<()> {
            self.inner.promote_pair(new_match).await
        }
        async fn get_match(&self, match_id: MatchId) -> Result<Option<Match>> {
            self.inner.get_match(match_id).await
        }
        async fn active_match_for_player(&self, player_id: &str) -> Result<Option<Match>> {
            self.inner.active_match_for_player(player_id).await
        }
        async fn list_open_matches(&self) -> Result<Vec<Match>> {
            self.inner.list_open_matches().await
        }
        async fn list_matches(&self) -> Result<Vec<Match>> {
            self.inner.list_matches().await
        }
        async fn compare_and_swap_match(
            &self,
            expected_phase: Phase,
            expected_version: u64,
            updated: Match,
        ) -> Result<Match> {
            self.commit_interleaved(&self.before_cas, updated.match_id)
                .await;
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::StateConflict {
                    match_id: updated.match_id,
                    expected: expected_phase,
                    actual: expected_phase,
                });
            }
            self.inner
                .compare_and_swap_match(expected_phase, expected_version, updated)
                .await
        }
        async fn upsert_score_report(&self, report: ScoreReport) -> Result<()> {
            self.commit_interleaved(&self.before_report, report.match_id)
                .await;
            self.inner.upsert_score_report(report).await
        }
        async fn score_reports_for_match(&self, match_id: MatchId) -> Result<Vec<ScoreReport>> {
            self.inner.score_reports_for_match(match_id).await
        }
        async fn list_score_reports(&self) -> Result<Vec<ScoreReport>> {
            self.inner.list_score_reports().await
        }
        async fn mark_reminder_sent(&self, match_id: MatchId, reporter_id: &str) -> Result<bool> {
            self.inner.mark_reminder_sent(match_id, reporter_id).await
        }
        async fn delete_score_reports(&self, match_id: MatchId) -> Result<usize> {
            self.inner.delete_score_reports(match_id).await
        }
        async fn insert_dispute(&self, dispute: Dispute) -> Result<()> {
            take_failure(&self.failing_dispute_inserts, "dispute")?;
            self.inner.insert_dispute(dispute).await
        }
        async fn remove_dispute(&self, dispute_id: Uuid) -> Result<bool> {
            self.inner.remove_dispute(dispute_id).await
        }
        async fn list_disputes(&self) -> Result<Vec<Dispute>> {
            self.inner.list_disputes().await
        }
        async fn get_profile(&self, player_id: &str) -> Result<Option<PlayerProfile>> {
            self.inner.get_profile(player_id).await
        }
        async fn upsert_profile(&self, profile: PlayerProfile) -> Result<()> {
            take_failure(&self.failing_profile_writes, "profile")?;
            self.inner.upsert_profile(profile).await
        }
        async fn counts(&self) -> Result<StoreCounts> {
            self.inner.counts().await
        }
    }

    struct Harness {
        machine: PhaseMachine,
        store: Arc<dyn DocumentStore>,
        clock: Arc<ManualClock>,
        publisher: Arc<MockNotificationPublisher>,
        match_id: MatchId,
    }

    fn fast_config(policy: CancellationPolicy) -> PhaseConfig {
        PhaseConfig {
            retry_base_delay_ms: 1,
            cancellation_policy: policy,
            ..PhaseConfig::default()
        }
    }

    async fn harness_with(
        store: Arc<dyn DocumentStore>,
        config: PhaseConfig,
        reps: (u32, u32),
    ) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let publisher = Arc::new(MockNotificationPublisher::new());
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let queue = QueueManager::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
            QueueConfig::default(),
            metrics.clone(),
        );

        let a = entry("a", reps.0);
        let mut b = entry("b", reps.1);
        b.joined_at = a.joined_at + ChronoDuration::seconds(1);
        store.insert_queue_entry(a.clone()).await.unwrap();
        store.insert_queue_entry(b.clone()).await.unwrap();
        let mut m = new_match(&a, &b);
        m.phase_deadline = Some(clock.now() + ChronoDuration::seconds(10));
        let match_id = m.match_id;
        store.promote_pair(m).await.unwrap();

        let machine = PhaseMachine::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
            config,
            queue,
            metrics,
        );
        Harness {
            machine,
            store,
            clock,
            publisher,
            match_id,
        }
    }

    async fn harness(policy: CancellationPolicy) -> Harness {
        let store = Arc::new(InMemoryDocumentStore::with_profiles(vec![
            PlayerProfile::new("a", 1000, "NA"),
            PlayerProfile::new("b", 1200, "NA"),
        ]));
        harness_with(store, fast_config(policy), (1000, 1200)).await
    }

    impl Harness {
        async fn expire_current_phase(&self) -> DeadlineReport {
            let m = self.machine.load(self.match_id).await.unwrap();
            let deadline = m.phase_deadline.unwrap();
            self.clock.set(deadline + ChronoDuration::seconds(1));
            self.machine.run_deadline_sweep().await.unwrap()
        }

        async fn phase(&self) -> Phase {
            self.machine.load(self.match_id).await.unwrap().phase
        }
    }

    #[tokio::test]
    async fn test_full_happy_path() {
        let h = harness(CancellationPolicy::None).await;
        let id = h.match_id;

        h.expire_current_phase().await;
        assert_eq!(h.phase().await, Phase::StageSelect);

        let err = h.machine.submit_stage_ban(id, "b", "A").await.unwrap_err();
        assert!(matches!(err, EngineError::NotYourTurn { .. }));

        let m = h.machine.submit_stage_ban(id, "a", "a").await.unwrap();
        assert_eq!(m.ban_turn, 1);
        assert_eq!(m.phase, Phase::StageSelect);

        let m = h.machine.submit_stage_ban(id, "b", "B").await.unwrap();
        assert_eq!(m.phase, Phase::CaptainSelect);
        assert_eq!(m.selected_stage.as_deref(), Some("C"));

        h.machine.submit_captain_pick(id, "a", "blaze").await.unwrap();
        let err = h
            .machine
            .submit_captain_pick(id, "a", "Aegis")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        let m = h.machine.submit_captain_pick(id, "b", "Blaze").await.unwrap();
        assert_eq!(m.phase, Phase::HostSelect);
        assert_eq!(m.captain_picks["a"], "Blaze");

        h.machine.submit_host_choice(id, "b").await.unwrap();
        let err = h.machine.submit_host_choice(id, "a").await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));

        let err = h.machine.submit_room_code(id, "a", "AB12").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        let err = h.machine.submit_room_code(id, "b", "AB-12").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        let m = h.machine.submit_room_code(id, "b", " ab12 ").await.unwrap();
        assert_eq!(m.phase, Phase::Active);
        assert_eq!(m.room_code.as_deref(), Some("AB12"));
        assert_eq!(
            m.phase_deadline,
            Some(m.phase_started_at + ChronoDuration::minutes(90))
        );

        // PREGAME, STAGE, CAPTAIN, HOST and ROOM_CODE exits, to both players
        assert_eq!(h.publisher.count_of(NotificationKind::PhaseAdvanced), 10);
        assert_eq!(h.publisher.count_of(NotificationKind::StageBanned), 4);
        assert_eq!(h.publisher.count_of(NotificationKind::CaptainPicked), 4);
    }

    #[tokio::test]
    async fn test_stage_select_expiry_bans_for_player_on_turn() {
        let h = harness(CancellationPolicy::None).await;
        h.expire_current_phase().await;

        let report = h.expire_current_phase().await;
        assert_eq!(report.expired, 1);

        let m = h.machine.load(h.match_id).await.unwrap();
        assert_eq!(m.phase, Phase::StageSelect);
        assert_eq!(m.stage_bans.len(), 1);
        assert_eq!(m.stage_bans[0].player_id, "a");
        assert!(m.stage_bans[0].automatic);
        assert_eq!(m.ban_turn, 1);
        assert_eq!(m.remaining_stages().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_ignores_matches_before_deadline() {
        let h = harness(CancellationPolicy::None).await;
        let report = h.machine.run_deadline_sweep().await.unwrap();
        assert_eq!(report, DeadlineReport::default());
        assert_eq!(h.phase().await, Phase::Pregame);
    }

    #[tokio::test]
    async fn test_captain_expiry_fills_missing_picks() {
        let h = harness(CancellationPolicy::None).await;
        let id = h.match_id;
        h.expire_current_phase().await;
        h.expire_current_phase().await;
        h.expire_current_phase().await;
        assert_eq!(h.phase().await, Phase::CaptainSelect);

        h.machine.submit_captain_pick(id, "b", "Halo").await.unwrap();
        h.expire_current_phase().await;

        let m = h.machine.load(id).await.unwrap();
        assert_eq!(m.phase, Phase::HostSelect);
        assert_eq!(m.captain_picks["b"], "Halo");
        assert!(h.machine.config().captains.contains(&m.captain_picks["a"]));
    }

    #[tokio::test]
    async fn test_host_expiry_prefers_higher_rep() {
        let h = harness(CancellationPolicy::None).await;
        for _ in 0..5 {
            h.expire_current_phase().await;
        }
        let m = h.machine.load(h.match_id).await.unwrap();
        assert_eq!(m.phase, Phase::RoomCode);
        assert_eq!(m.host_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_default_host_tie_goes_to_earlier_joiner() {
        let a = entry("a", 1500);
        let mut b = entry("b", 1500);
        b.joined_at = a.joined_at - ChronoDuration::seconds(5);
        let m = new_match(&a, &b);
        assert_eq!(default_host(&m).player_id, "b");

        b.joined_at = a.joined_at + ChronoDuration::seconds(5);
        let m = new_match(&a, &b);
        assert_eq!(default_host(&m).player_id, "a");
    }

    #[tokio::test]
    async fn test_room_code_expiry_cancels_without_rep_change() {
        let h = harness(CancellationPolicy::None).await;
        for _ in 0..6 {
            h.expire_current_phase().await;
        }

        let m = h.machine.load(h.match_id).await.unwrap();
        assert_eq!(m.phase, Phase::Cancelled);
        assert!(m.terminal_reason.is_some());
        assert!(m.outcome.is_none());
        assert_eq!(h.store.get_profile("a").await.unwrap().unwrap().rep, 1000);
        assert_eq!(h.store.get_profile("b").await.unwrap().unwrap().rep, 1200);
        assert_eq!(h.publisher.count_of(NotificationKind::MatchCancelled), 2);
        assert!(h.store.list_queue_entries().await.unwrap().is_empty());
        assert!(h.store.active_match_for_player("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_policy_puts_players_back() {
        let h = harness(CancellationPolicy::Requeue).await;
        for _ in 0..6 {
            h.expire_current_phase().await;
        }
        assert_eq!(h.phase().await, Phase::Cancelled);
        assert!(h.store.get_queue_entry("a").await.unwrap().is_some());
        assert!(h.store.get_queue_entry("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_only_from_room_code_or_active() {
        let h = harness(CancellationPolicy::None).await;
        let err = h
            .machine
            .cancel_match(h.match_id, "admin")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: Phase::Pregame,
                to: Phase::Cancelled,
                ..
            }
        ));

        for _ in 0..5 {
            h.expire_current_phase().await;
        }
        let m = h.machine.cancel_match(h.match_id, "admin").await.unwrap();
        assert_eq!(m.phase, Phase::Cancelled);
        assert_eq!(m.terminal_reason.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_transition_to_checks_phase_and_graph() {
        let h = harness(CancellationPolicy::None).await;
        let id = h.match_id;

        let err = h
            .machine
            .transition_to(id, Phase::StageSelect, Phase::CaptainSelect, "test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::StateConflict {
                expected: Phase::StageSelect,
                actual: Phase::Pregame,
                ..
            }
        ));

        let err = h
            .machine
            .transition_to(id, Phase::Pregame, Phase::Active, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let m = h
            .machine
            .transition_to(id, Phase::Pregame, Phase::StageSelect, "ready")
            .await
            .unwrap();
        assert_eq!(m.phase, Phase::StageSelect);
        assert_eq!(m.version, 1);
    }

    #[tokio::test]
    async fn test_fail_match_is_final() {
        let h = harness(CancellationPolicy::None).await;
        let m = h.machine.fail_match(h.match_id, "operator").await.unwrap();
        assert_eq!(m.phase, Phase::Failed);
        assert_eq!(h.publisher.count_of(NotificationKind::MatchFailed), 2);

        let err = h
            .machine
            .fail_match(h.match_id, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_version_races_are_retried() {
        let inner = InMemoryDocumentStore::with_profiles(vec![
            PlayerProfile::new("a", 1000, "NA"),
            PlayerProfile::new("b", 1200, "NA"),
        ]);
        let store: Arc<dyn DocumentStore> = Arc::new(RacingStore::new(inner, 2));
        let h = harness_with(store, fast_config(CancellationPolicy::None), (1000, 1200)).await;

        let m = h
            .machine
            .transition_to(h.match_id, Phase::Pregame, Phase::StageSelect, "ready")
            .await
            .unwrap();
        assert_eq!(m.phase, Phase::StageSelect);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_to_callers() {
        let inner = InMemoryDocumentStore::with_profiles(vec![]);
        let store: Arc<dyn DocumentStore> = Arc::new(RacingStore::new(inner, 4));
        let h = harness_with(store, fast_config(CancellationPolicy::None), (1000, 1200)).await;

        let err = h
            .machine
            .transition_to(h.match_id, Phase::Pregame, Phase::StageSelect, "ready")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        // A caller losing every race does not fail the match.
        assert_eq!(h.phase().await, Phase::Pregame);
    }

    #[tokio::test]
    async fn test_exhausted_timeout_fails_match() {
        let inner = InMemoryDocumentStore::with_profiles(vec![]);
        let store: Arc<dyn DocumentStore> = Arc::new(RacingStore::new(inner, 4));
        let h = harness_with(store, fast_config(CancellationPolicy::None), (1000, 1200)).await;

        let report = h.expire_current_phase().await;
        assert_eq!(report.failed, 1);

        let m = h.machine.load(h.match_id).await.unwrap();
        assert_eq!(m.phase, Phase::Failed);
        assert!(m.terminal_reason.unwrap().contains("PREGAME"));
    }

    async fn advance_to(h: &Harness, phase: Phase) {
        while h.phase().await != phase {
            h.expire_current_phase().await;
        }
    }

    fn racing_store() -> Arc<RacingStore> {
        Arc::new(RacingStore::new(
            InMemoryDocumentStore::with_profiles(vec![
                PlayerProfile::new("a", 1000, "NA"),
                PlayerProfile::new("b", 1200, "NA"),
            ]),
            0,
        ))
    }

    #[tokio::test]
    async fn test_transition_to_never_resolves_active_match() {
        let h = harness(CancellationPolicy::None).await;
        advance_to(&h, Phase::RoomCode).await;
        h.machine
            .submit_room_code(h.match_id, "b", "ab12")
            .await
            .unwrap();

        for target in [Phase::Completed, Phase::Disputed] {
            let err = h
                .machine
                .transition_to(h.match_id, Phase::Active, target, "manual")
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Validation { .. }), "{}", target);
        }

        let m = h.machine.load(h.match_id).await.unwrap();
        assert_eq!(m.phase, Phase::Active);
        assert!(m.outcome.is_none());
        assert!(h.store.list_disputes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transition_to_requires_phase_choices() {
        let h = harness(CancellationPolicy::None).await;
        let id = h.match_id;
        h.machine
            .transition_to(id, Phase::Pregame, Phase::StageSelect, "ready")
            .await
            .unwrap();

        let skips = [
            (Phase::StageSelect, Phase::CaptainSelect),
            (Phase::CaptainSelect, Phase::HostSelect),
            (Phase::HostSelect, Phase::RoomCode),
            (Phase::RoomCode, Phase::Active),
        ];
        for (from, to) in skips {
            advance_to(&h, from).await;
            if from == Phase::CaptainSelect {
                h.machine.submit_captain_pick(id, "a", "Aegis").await.unwrap();
            }
            let err = h
                .machine
                .transition_to(id, from, to, "skip")
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Validation { .. }), "{} -> {}", from, to);
            assert_eq!(h.phase().await, from);
        }

        let m = h.machine.load(id).await.unwrap();
        assert!(m.selected_stage.is_some());
        assert!(m.host_id.is_some());
        assert!(m.room_code.is_none());
    }

    #[tokio::test]
    async fn test_manual_ban_beats_racing_stage_timeout() {
        let store = racing_store();
        let h = harness_with(store.clone(), fast_config(CancellationPolicy::None), (1000, 1200)).await;
        advance_to(&h, Phase::StageSelect).await;

        let deadline = h.machine.load(h.match_id).await.unwrap().phase_deadline.unwrap();
        let now = deadline + ChronoDuration::seconds(1);
        h.clock.set(now);
        // Player a bans after the sweep read the match but before its write
        store.interleave_before_cas(Box::new(move |current| {
            let mut manual = current.clone();
            let config = fast_config(CancellationPolicy::None);
            apply_ban(&config, &mut manual, 0, "A".to_string(), false, now);
            manual
        }));

        let report = h.machine.run_deadline_sweep().await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);

        let m = h.machine.load(h.match_id).await.unwrap();
        assert_eq!(m.phase, Phase::StageSelect);
        assert_eq!(m.stage_bans.len(), 1);
        assert!(!m.stage_bans[0].automatic);
        assert_eq!(m.ban_turn, 1);
    }

    #[tokio::test]
    async fn test_room_code_beats_racing_cancel() {
        let store = racing_store();
        let h = harness_with(store.clone(), fast_config(CancellationPolicy::None), (1000, 1200)).await;
        advance_to(&h, Phase::RoomCode).await;

        let deadline = h.machine.load(h.match_id).await.unwrap().phase_deadline.unwrap();
        let now = deadline + ChronoDuration::seconds(1);
        h.clock.set(now);
        store.interleave_before_cas(Box::new(move |current| {
            let mut manual = current.clone();
            manual.room_code = Some("AB12".to_string());
            enter_phase(&fast_config(CancellationPolicy::None), &mut manual, Phase::Active, now);
            manual
        }));

        let report = h.machine.run_deadline_sweep().await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.skipped, 1);

        let m = h.machine.load(h.match_id).await.unwrap();
        assert_eq!(m.phase, Phase::Active);
        assert_eq!(m.room_code.as_deref(), Some("AB12"));
        assert!(m.terminal_reason.is_none());
        assert_eq!(h.publisher.count_of(NotificationKind::MatchCancelled), 0);
    }
}
