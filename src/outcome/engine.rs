//! Score reports, disputes and outcome application
//!
//! The match is moved to COMPLETED with the outcome embedded and flagged as
//! pending before any profile is touched, so a given outcome is applied at
//! most once even when both reports race each other. Each profile remembers
//! the last match written to it, which lets the reconciliation sweep finish
//! a pending outcome without applying it twice.

use crate::amqp::publisher::{publish_all, NotificationPublisher};
use crate::club::ClubLeagueProvider;
use crate::clock::Clock;
use crate::config::OutcomeConfig;
use crate::error::{EngineError, Result};
use crate::metrics::MetricsCollector;
use crate::outcome::rep::{apply_delta, club_rep_gain, compute_rep_change, RepInput, CLUB_LOSS};
use crate::phase::{PhaseMachine, Transition};
use crate::store::DocumentStore;
use crate::types::{
    ClubRepTransfer, Dispute, Match, MatchId, MatchOutcome, Notification, NotificationKind,
    ParticipantSlot, Phase, PlayerProfile, RankChange, RankTier, ScoreReport,
};
use crate::utils::generate_dispute_id;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a score report led to
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// Stored; the opponent has not reported yet
    AwaitingOpponent,
    /// The reports disagree and the match is now DISPUTED
    Disputed { dispute_id: Uuid },
    /// The reports agree and the outcome was applied
    Completed(MatchOutcome),
    /// Another request resolved the match first
    AlreadyResolved { phase: Phase },
}

/// Turns score reports into outcomes
pub struct OutcomeEngine {
    store: Arc<dyn DocumentStore>,
    publisher: Arc<dyn NotificationPublisher>,
    clock: Arc<dyn Clock>,
    clubs: Arc<dyn ClubLeagueProvider>,
    phases: Arc<PhaseMachine>,
    config: OutcomeConfig,
    metrics: Arc<MetricsCollector>,
}

impl OutcomeEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        publisher: Arc<dyn NotificationPublisher>,
        clock: Arc<dyn Clock>,
        clubs: Arc<dyn ClubLeagueProvider>,
        phases: Arc<PhaseMachine>,
        config: OutcomeConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            clubs,
            phases,
            config,
            metrics,
        }
    }

    pub async fn report_score(
        &self,
        match_id: MatchId,
        reporter_id: &str,
        self_score: u32,
        opponent_score: u32,
    ) -> Result<ReportOutcome> {
        if self_score == opponent_score {
            return Err(EngineError::validation("Draws cannot be reported"));
        }
        if self_score > self.config.max_reported_score
            || opponent_score > self.config.max_reported_score
        {
            return Err(EngineError::validation(format!(
                "Scores cannot exceed {}",
                self.config.max_reported_score
            )));
        }

        let m = match self.store.get_match(match_id).await? {
            Some(m) if m.phase == Phase::Active && m.has_participant(reporter_id) => m,
            _ => {
                return Err(EngineError::NoActiveMatch {
                    player_id: reporter_id.to_string(),
                })
            }
        };
        let opponent_id = m.participants[1 - slot_index(&m, reporter_id)?]
            .player_id
            .clone();

        let existing = self.store.score_reports_for_match(match_id).await?;
        let reminder_sent = existing
            .iter()
            .any(|r| r.reporter_id == reporter_id && r.reminder_sent);
        let report = ScoreReport {
            match_id,
            reporter_id: reporter_id.to_string(),
            claimed_self_score: self_score,
            claimed_opponent_score: opponent_score,
            reported_at: self.clock.now(),
            reminder_sent,
        };
        self.store.upsert_score_report(report.clone()).await?;

        // The match may have closed between the read above and the write
        let current = self.phases.load(match_id).await?;
        if current.phase != Phase::Active {
            if let Err(e) = self.store.delete_score_reports(match_id).await {
                warn!("Failed to clear stale report on match {}: {}", match_id, e);
            }
            debug!(
                "Match {} became {} before '{}' reported",
                match_id, current.phase, reporter_id
            );
            return Ok(ReportOutcome::AlreadyResolved {
                phase: current.phase,
            });
        }
        self.metrics.record_score_report();
        debug!(
            "Match {}: '{}' reported {}-{}",
            match_id, reporter_id, self_score, opponent_score
        );

        let opponent_report = self
            .store
            .score_reports_for_match(match_id)
            .await?
            .into_iter()
            .find(|r| r.reporter_id == opponent_id);

        match opponent_report {
            None => {
                publish_all(
                    self.publisher.as_ref(),
                    vec![Notification::new(
                        reporter_id,
                        NotificationKind::AwaitingOpponent,
                        json!({
                            "match_id": match_id,
                            "opponent_id": opponent_id,
                            "self_score": self_score,
                            "opponent_score": opponent_score,
                        }),
                    )],
                )
                .await;
                Ok(ReportOutcome::AwaitingOpponent)
            }
            Some(theirs) if report.agrees_with(&theirs) => self.complete(&m, &report).await,
            Some(theirs) => self.dispute(&m, report, theirs).await,
        }
    }

    async fn dispute(
        &self,
        m: &Match,
        mine: ScoreReport,
        theirs: ScoreReport,
    ) -> Result<ReportOutcome> {
        // Keep the reports in slot order.
        let reports = if m.participants[0].player_id == mine.reporter_id {
            [mine, theirs]
        } else {
            [theirs, mine]
        };
        let dispute = Dispute {
            dispute_id: generate_dispute_id(),
            match_id: m.match_id,
            reports,
            opened_at: self.clock.now(),
        };
        let dispute_id = dispute.dispute_id;
        let claims = json!({
            "match_id": m.match_id,
            "dispute_id": dispute_id,
            "claims": dispute.reports.iter().map(|r| json!({
                "player_id": r.reporter_id,
                "self_score": r.claimed_self_score,
                "opponent_score": r.claimed_opponent_score,
            })).collect::<Vec<_>>(),
        });

        // The record goes in first; the match only becomes DISPUTED once it exists.
        if let Err(e) = self.store.insert_dispute(dispute.clone()).await {
            return match self.phases.load(m.match_id).await?.phase {
                phase if phase.is_terminal() => Ok(ReportOutcome::AlreadyResolved { phase }),
                _ => Err(e),
            };
        }

        let [a, b] = &dispute.reports;
        let result = self
            .phases
            .mutate(m.match_id, Phase::Active, |current, now| {
                let mut updated = current.clone();
                close(&mut updated, Phase::Disputed, now);
                updated.terminal_reason = Some("score reports disagree".to_string());
                record_claims(&mut updated, a, b);
                Ok(Some(updated))
            })
            .await;
        let transition = match resolved(result) {
            Ok(Resolution::Committed(transition)) => transition,
            Ok(Resolution::Lost(phase)) => {
                self.drop_dispute(dispute_id).await;
                return Ok(ReportOutcome::AlreadyResolved { phase });
            }
            Err(e) => {
                self.drop_dispute(dispute_id).await;
                return Err(e);
            }
        };
        let after = transition.after;

        if let Err(e) = self.store.delete_score_reports(after.match_id).await {
            warn!("Failed to clear reports of disputed match {}: {}", after.match_id, e);
        }

        self.metrics
            .record_phase_transition(Phase::Active, Phase::Disputed);
        warn!("Match {} disputed ({})", after.match_id, dispute_id);
        publish_all(
            self.publisher.as_ref(),
            Notification::to_both(&after, NotificationKind::DisputeOpened, claims),
        )
        .await;

        Ok(ReportOutcome::Disputed { dispute_id })
    }

    async fn drop_dispute(&self, dispute_id: Uuid) {
        if let Err(e) = self.store.remove_dispute(dispute_id).await {
            warn!("Failed to drop unused dispute {}: {}", dispute_id, e);
        }
    }

    async fn complete(&self, m: &Match, report: &ScoreReport) -> Result<ReportOutcome> {
        let reporter_idx = slot_index(m, &report.reporter_id)?;
        let reporter_won = report.claimed_self_score > report.claimed_opponent_score;
        let (winner_idx, winner_score, loser_score) = if reporter_won {
            (
                reporter_idx,
                report.claimed_self_score,
                report.claimed_opponent_score,
            )
        } else {
            (
                1 - reporter_idx,
                report.claimed_opponent_score,
                report.claimed_self_score,
            )
        };
        let winner = &m.participants[winner_idx];
        let loser = &m.participants[1 - winner_idx];

        let change = compute_rep_change(&RepInput {
            winner_rep: winner.rep,
            loser_rep: loser.rep,
            winner_score,
            loser_score,
            winner_streak: winner.win_streak,
            hypercharged: m.is_hypercharged,
        });
        let club_rep = self
            .club_transfer(winner, loser, winner_score.abs_diff(loser_score))
            .await;
        let outcome = MatchOutcome {
            winner_id: winner.player_id.clone(),
            loser_id: loser.player_id.clone(),
            winner_score,
            loser_score,
            winner_rep_delta: change.winner_delta,
            loser_rep_delta: change.loser_delta,
            hypercharged: m.is_hypercharged,
            club_rep,
            winner_rank_change: rank_change_for(winner.rep, change.winner_delta),
            loser_rank_change: rank_change_for(loser.rep, change.loser_delta),
        };

        let outcome_ref = &outcome;
        let result = self
            .phases
            .mutate(m.match_id, Phase::Active, |current, now| {
                let mut updated = current.clone();
                close(&mut updated, Phase::Completed, now);
                updated.outcome = Some(outcome_ref.clone());
                updated.outcome_pending = true;
                for slot in updated.participants.iter_mut() {
                    slot.reported_score = Some(if slot.player_id == outcome_ref.winner_id {
                        outcome_ref.winner_score
                    } else {
                        outcome_ref.loser_score
                    });
                }
                Ok(Some(updated))
            })
            .await;
        let transition = match resolved(result)? {
            Resolution::Committed(transition) => transition,
            Resolution::Lost(phase) => return Ok(ReportOutcome::AlreadyResolved { phase }),
        };
        let after = transition.after;

        let settlement = self.settle(&after, &outcome).await;
        let mut notifications = settlement.notifications;
        let new_reps: serde_json::Map<String, serde_json::Value> = settlement
            .profiles
            .iter()
            .map(|profile| (profile.player_id.clone(), json!(profile.rep)))
            .collect();
        if !settlement.complete {
            error!(
                "Outcome of match {} is pending until its profile writes succeed",
                after.match_id
            );
        }

        if let Some(transfer) = &outcome.club_rep {
            self.forward_club_rep(transfer).await;
        }

        if let Err(e) = self.store.delete_score_reports(after.match_id).await {
            warn!(
                "Failed to clear reports of completed match {}: {}",
                after.match_id, e
            );
        }

        self.metrics
            .record_phase_transition(Phase::Active, Phase::Completed);
        self.metrics.record_rep_gain(change.winner_delta);
        info!(
            "Match {} completed: '{}' beat '{}' {}-{} ({:+}/{:+}){}",
            after.match_id,
            outcome.winner_id,
            outcome.loser_id,
            winner_score,
            loser_score,
            change.winner_delta,
            change.loser_delta,
            if outcome.hypercharged { ", hypercharged" } else { "" }
        );

        notifications.extend(Notification::to_both(
            &after,
            NotificationKind::MatchComplete,
            json!({
                "match_id": after.match_id,
                "outcome": outcome,
                "rep": new_reps,
            }),
        ));
        publish_all(self.publisher.as_ref(), notifications).await;

        Ok(ReportOutcome::Completed(outcome))
    }

    /// Club rep for the match, if both clubs play in an active league season
    async fn club_transfer(
        &self,
        winner: &ParticipantSlot,
        loser: &ParticipantSlot,
        run_differential: u32,
    ) -> Option<ClubRepTransfer> {
        let (winner_club, loser_club) = match (&winner.club_id, &loser.club_id) {
            (Some(w), Some(l)) if w != l => (w, l),
            _ => return None,
        };

        let eligible = async {
            Ok::<bool, EngineError>(
                self.clubs.is_season_active().await?
                    && self.clubs.is_tracked(winner_club).await?
                    && self.clubs.is_tracked(loser_club).await?,
            )
        }
        .await;

        match eligible {
            Ok(true) => Some(ClubRepTransfer {
                winner_club: winner_club.clone(),
                loser_club: loser_club.clone(),
                winner_club_delta: club_rep_gain(run_differential),
                loser_club_delta: -CLUB_LOSS,
            }),
            Ok(false) => None,
            Err(e) => {
                warn!("Club league unavailable, skipping club rep: {}", e);
                None
            }
        }
    }

    async fn forward_club_rep(&self, transfer: &ClubRepTransfer) {
        for (club, delta) in [
            (&transfer.winner_club, transfer.winner_club_delta),
            (&transfer.loser_club, transfer.loser_club_delta),
        ] {
            if let Err(e) = self.clubs.apply_club_rep(club, delta).await {
                warn!("Failed to apply {:+} club rep to {}: {}", delta, club, e);
            }
        }
    }

    /// Write both sides of a committed outcome and clear the pending flag
    /// once both profiles carry it
    async fn settle(&self, m: &Match, outcome: &MatchOutcome) -> Settlement {
        let mut settlement = Settlement {
            profiles: Vec::new(),
            notifications: Vec::new(),
            complete: true,
        };
        let sides = [
            (&outcome.winner_id, outcome.winner_rep_delta, true),
            (&outcome.loser_id, outcome.loser_rep_delta, false),
        ];

        for (player_id, delta, won) in sides {
            let slot = match m.participant(player_id) {
                Some(slot) => slot,
                None => {
                    error!("Match {} has no participant '{}'", m.match_id, player_id);
                    settlement.complete = false;
                    continue;
                }
            };
            match self
                .apply_to_profile(m.match_id, slot, delta, won, m.phase_started_at)
                .await
            {
                Ok((profile, rank_change)) => {
                    if let Some(rank_change) = rank_change {
                        settlement
                            .notifications
                            .push(rank_notification(&profile, rank_change));
                    }
                    settlement.profiles.push(profile);
                }
                Err(e) => {
                    error!(
                        "Failed to apply outcome of match {} to '{}': {}",
                        m.match_id, player_id, e
                    );
                    settlement.complete = false;
                }
            }
        }

        if settlement.complete {
            let cleared = self
                .phases
                .mutate(m.match_id, Phase::Completed, |current, _| {
                    if !current.outcome_pending {
                        return Ok(None);
                    }
                    let mut updated = current.clone();
                    updated.outcome_pending = false;
                    Ok(Some(updated))
                })
                .await;
            if let Err(e) = cleared {
                warn!("Failed to clear pending outcome of match {}: {}", m.match_id, e);
            }
        }
        settlement
    }

    /// Apply one side of an outcome. A profile that already carries this
    /// match is returned unchanged.
    async fn apply_to_profile(
        &self,
        match_id: MatchId,
        slot: &ParticipantSlot,
        delta: i32,
        won: bool,
        now: DateTime<Utc>,
    ) -> Result<(PlayerProfile, Option<RankChange>)> {
        let mut profile = self
            .store
            .get_profile(&slot.player_id)
            .await?
            .unwrap_or_else(|| PlayerProfile::new(slot.player_id.clone(), slot.rep, slot.region.clone()));
        if profile.last_match_id == Some(match_id) {
            return Ok((profile, None));
        }

        let before = profile.rank_tier();
        profile.rep = apply_delta(profile.rep, delta);
        if won {
            profile.wins += 1;
            profile.win_streak += 1;
        } else {
            profile.losses += 1;
            profile.win_streak = 0;
        }
        profile.last_match_at = Some(now);
        profile.last_match_id = Some(match_id);
        let after = profile.rank_tier();

        self.store.upsert_profile(profile.clone()).await?;

        let rank_change = (before != after).then_some(RankChange {
            from: before,
            to: after,
        });
        if let Some(change) = &rank_change {
            self.metrics.record_rank_change(change);
            info!("Player '{}' moved {} -> {}", profile.player_id, change.from, change.to);
        }
        Ok((profile, rank_change))
    }

    /// Finish outcomes whose profile writes failed after the match completed
    pub async fn run_outcome_reconciliation(&self) -> Result<usize> {
        let mut settled = 0;
        let mut notifications = Vec::new();

        for m in self.store.list_matches().await? {
            if m.phase != Phase::Completed || !m.outcome_pending {
                continue;
            }
            let outcome = match &m.outcome {
                Some(outcome) => outcome.clone(),
                None => continue,
            };
            let settlement = self.settle(&m, &outcome).await;
            if settlement.complete {
                info!("Pending outcome of match {} applied", m.match_id);
                settled += 1;
            }
            notifications.extend(settlement.notifications);
        }

        publish_all(self.publisher.as_ref(), notifications).await;
        Ok(settled)
    }

    /// Remind opponents who have not reported once the delay has passed
    pub async fn run_reminder_sweep(&self) -> Result<usize> {
        let now = self.clock.now();
        let delay = self.config.reminder_delay();
        let mut reminded = 0;
        let mut notifications = Vec::new();

        for report in self.store.list_score_reports().await? {
            if report.reminder_sent || now - report.reported_at < delay {
                continue;
            }
            let m = match self.store.get_match(report.match_id).await? {
                Some(m) if m.phase == Phase::Active => m,
                _ => continue,
            };
            let opponent = match m.opponent_of(&report.reporter_id) {
                Some(opponent) => opponent.player_id.clone(),
                None => continue,
            };

            if !self
                .store
                .mark_reminder_sent(report.match_id, &report.reporter_id)
                .await?
            {
                continue;
            }
            self.metrics.record_reminder();
            reminded += 1;
            notifications.push(Notification::new(
                opponent,
                NotificationKind::Reminder,
                json!({
                    "match_id": report.match_id,
                    "reported_by": report.reporter_id,
                    "reported_at": report.reported_at,
                }),
            ));
        }

        if reminded > 0 {
            info!("Sent {} score report reminders", reminded);
        }
        publish_all(self.publisher.as_ref(), notifications).await;
        Ok(reminded)
    }
}

struct Settlement {
    profiles: Vec<PlayerProfile>,
    notifications: Vec<Notification>,
    /// Both profiles carry the outcome
    complete: bool,
}

enum Resolution {
    Committed(Transition),
    Lost(Phase),
}

/// Map a resolution write to either the committed transition or the
/// terminal phase another request reached first
fn resolved(result: Result<Option<Transition>>) -> Result<Resolution> {
    match result {
        Ok(Some(transition)) => Ok(Resolution::Committed(transition)),
        Ok(None) => Err(EngineError::internal("Resolution produced no change")),
        Err(EngineError::StateConflict { actual, .. }) if actual.is_terminal() => {
            debug!("Match already resolved as {}", actual);
            Ok(Resolution::Lost(actual))
        }
        Err(e) => Err(e),
    }
}

fn slot_index(m: &Match, player_id: &str) -> Result<usize> {
    m.participant_index(player_id)
        .ok_or_else(|| EngineError::NotParticipant {
            match_id: m.match_id,
            player_id: player_id.to_string(),
        })
}

fn close(m: &mut Match, phase: Phase, now: DateTime<Utc>) {
    m.phase = phase;
    m.phase_started_at = now;
    m.phase_deadline = None;
}

fn record_claims(m: &mut Match, a: &ScoreReport, b: &ScoreReport) {
    for slot in m.participants.iter_mut() {
        if let Some(report) = [a, b].into_iter().find(|r| r.reporter_id == slot.player_id) {
            slot.reported_score = Some(report.claimed_self_score);
        }
    }
}

/// Tier change implied by the snapshot rep and the delta
fn rank_change_for(rep: u32, delta: i32) -> Option<RankChange> {
    let from = RankTier::for_rep(rep);
    let to = RankTier::for_rep(apply_delta(rep, delta));
    (from != to).then_some(RankChange { from, to })
}

fn rank_notification(profile: &PlayerProfile, change: RankChange) -> Notification {
    let kind = if change.is_promotion() {
        NotificationKind::RankUp
    } else {
        NotificationKind::RankDown
    };
    Notification::new(
        profile.player_id.clone(),
        kind,
        json!({
            "from": change.from,
            "to": change.to,
            "rep": profile.rep,
        }),
    )
}
