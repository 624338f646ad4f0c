//! The periodic matchmaking pass
//!
//! Each pass loads the whole queue, selects pairs with the scorer and
//! promotes each pair into a PREGAME match in a single store transaction.

use crate::amqp::publisher::{publish_all, NotificationPublisher};
use crate::clock::Clock;
use crate::config::{MatchmakingConfig, PhaseConfig, QueueConfig};
use crate::error::Result;
use crate::matchmaking::scorer::{select_pairs, PairScorer, Pairing, WeightedPairScorer};
use crate::metrics::MetricsCollector;
use crate::store::DocumentStore;
use crate::types::{
    Match, MatchId, Notification, NotificationKind, ParticipantSlot, Phase, PlayerId, QueueEntry,
};
use crate::utils::generate_match_id;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one matchmaking pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub queued: usize,
    pub created: Vec<MatchId>,
    /// Pairs whose promotion was aborted because an entry vanished
    pub aborted: usize,
    pub unmatched: usize,
}

/// Pairs queued players into matches
pub struct Matchmaker {
    store: Arc<dyn DocumentStore>,
    publisher: Arc<dyn NotificationPublisher>,
    clock: Arc<dyn Clock>,
    scorer: Arc<dyn PairScorer>,
    config: MatchmakingConfig,
    phases: PhaseConfig,
    metrics: Arc<MetricsCollector>,
}

impl Matchmaker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        publisher: Arc<dyn NotificationPublisher>,
        clock: Arc<dyn Clock>,
        config: MatchmakingConfig,
        queue: &QueueConfig,
        phases: PhaseConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let scorer = Arc::new(WeightedPairScorer::from_config(
            &config,
            queue.max_queue_age(),
        ));
        Self {
            store,
            publisher,
            clock,
            scorer,
            config,
            phases,
            metrics,
        }
    }

    /// Replace the default weighted scorer
    pub fn with_scorer(mut self, scorer: Arc<dyn PairScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Run one pass over the queue
    pub async fn run_pass(&self) -> Result<PassReport> {
        let entries = self.store.list_queue_entries().await?;
        let mut report = PassReport {
            queued: entries.len(),
            ..PassReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let pairings = select_pairs(
            &entries,
            self.scorer.as_ref(),
            self.config.acceptance_threshold,
            self.config.cross_region_penalty,
        );
        debug!(
            "Matchmaking pass: {} queued, {} candidate pairs",
            entries.len(),
            pairings.len()
        );

        let mut paired: HashSet<PlayerId> = HashSet::new();
        let mut notifications = Vec::new();
        for pairing in pairings {
            let new_match = self.build_match(&pairing).await?;
            let match_id = new_match.match_id;

            match self.store.promote_pair(new_match.clone()).await {
                Ok(()) => {
                    paired.insert(pairing.first.player_id.clone());
                    paired.insert(pairing.second.player_id.clone());
                    report.created.push(match_id);

                    let now = new_match.created_at;
                    self.metrics.record_match_created(
                        pairing.cross_region,
                        new_match.is_hypercharged,
                        [
                            wait_time(&pairing.first, now),
                            wait_time(&pairing.second, now),
                        ],
                    );
                    info!(
                        "Match {} created: '{}' ({}) vs '{}' ({}), score {:.3}{}{}",
                        match_id,
                        pairing.first.player_id,
                        pairing.first.rep,
                        pairing.second.player_id,
                        pairing.second.rep,
                        pairing.score,
                        if pairing.cross_region { ", cross-region" } else { "" },
                        if new_match.is_hypercharged { ", hypercharged" } else { "" },
                    );
                    notifications.extend(match_found_notifications(&new_match));
                }
                Err(e) => {
                    report.aborted += 1;
                    warn!(
                        "Promotion of '{}' and '{}' aborted: {}",
                        pairing.first.player_id, pairing.second.player_id, e
                    );
                }
            }
        }

        let unmatched: Vec<PlayerId> = entries
            .iter()
            .map(|e| e.player_id.clone())
            .filter(|id| !paired.contains(id))
            .collect();
        report.unmatched = unmatched.len();
        self.store.increment_match_attempts(&unmatched).await?;

        publish_all(self.publisher.as_ref(), notifications).await;
        Ok(report)
    }

    async fn build_match(&self, pairing: &Pairing) -> Result<Match> {
        let now = self.clock.now();
        let first = self.participant(&pairing.first).await?;
        let second = self.participant(&pairing.second).await?;
        let hypercharged = roll_hypercharge(self.config.hypercharge_probability);

        Ok(Match {
            match_id: generate_match_id(),
            participants: [first, second],
            phase: Phase::Pregame,
            phase_started_at: now,
            phase_deadline: self.phases.phase_timeout(Phase::Pregame).map(|t| now + t),
            stage_pool: self.phases.stages.clone(),
            stage_bans: Vec::new(),
            ban_turn: 0,
            selected_stage: None,
            captain_picks: BTreeMap::new(),
            host_id: None,
            room_code: None,
            is_hypercharged: hypercharged,
            created_at: now,
            terminal_reason: None,
            outcome: None,
            outcome_pending: false,
            version: 0,
        })
    }

    /// Slot snapshot from the queue entry; the club comes from the profile
    async fn participant(&self, entry: &QueueEntry) -> Result<ParticipantSlot> {
        let club_id = self
            .store
            .get_profile(&entry.player_id)
            .await?
            .and_then(|profile| profile.club_id);

        Ok(ParticipantSlot {
            player_id: entry.player_id.clone(),
            rep: entry.rep,
            rank_tier: entry.rank_tier,
            region: entry.region.clone(),
            win_streak: entry.win_streak,
            queued_at: entry.joined_at,
            club_id,
            reported_score: None,
        })
    }
}

fn roll_hypercharge(probability: f64) -> bool {
    rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
}

fn wait_time(entry: &QueueEntry, now: DateTime<Utc>) -> std::time::Duration {
    (now - entry.joined_at).to_std().unwrap_or_default()
}

fn match_found_notifications(m: &Match) -> Vec<Notification> {
    m.participants
        .iter()
        .enumerate()
        .map(|(idx, slot)| {
            let opponent = &m.participants[1 - idx];
            Notification::new(
                slot.player_id.clone(),
                NotificationKind::MatchFound,
                json!({
                    "match_id": m.match_id,
                    "opponent_id": opponent.player_id,
                    "opponent_rep": opponent.rep,
                    "opponent_tier": opponent.rank_tier,
                    "hypercharged": m.is_hypercharged,
                    "phase": m.phase,
                    "phase_deadline": m.phase_deadline,
                }),
            )
        })
        .collect()
}
