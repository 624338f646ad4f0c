//! The ranked engine facade
//!
//! [`RankedEngine`] wires the queue manager, matchmaker, phase machine and
//! outcome engine to one store, publisher and clock, and is the only type
//! the service layer and the simulator talk to.

use crate::amqp::messages::EngineCommand;
use crate::amqp::publisher::NotificationPublisher;
use crate::club::{ClubLeagueProvider, NoClubLeague};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::matchmaking::{Matchmaker, PassReport};
use crate::metrics::MetricsCollector;
use crate::outcome::{OutcomeEngine, ReportOutcome};
use crate::phase::{DeadlineReport, PhaseMachine};
use crate::queue::{QueueManager, SweepReport};
use crate::store::{DocumentStore, InMemoryDocumentStore, StoreCounts};
use crate::types::{Match, MatchId, Notification, NotificationKind, Phase, PlayerProfile, QueueEntry};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builder for [`RankedEngine`]
pub struct RankedEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn DocumentStore>>,
    publisher: Option<Arc<dyn NotificationPublisher>>,
    clubs: Option<Arc<dyn ClubLeagueProvider>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RankedEngineBuilder {
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn NotificationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn clubs(mut self, clubs: Arc<dyn ClubLeagueProvider>) -> Self {
        self.clubs = Some(clubs);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assemble the engine. A publisher is required; everything else has an
    /// in-process default.
    pub fn build(self) -> Result<RankedEngine> {
        let publisher = self
            .publisher
            .ok_or_else(|| EngineError::internal("A notification publisher is required"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryDocumentStore::new()));
        let clubs = self.clubs.unwrap_or_else(|| Arc::new(NoClubLeague));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(MetricsCollector::new().map_err(|e| {
                EngineError::internal(format!("Failed to create metrics collector: {}", e))
            })?),
        };
        let config = self.config;

        let queue = QueueManager::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
            config.queue.clone(),
            metrics.clone(),
        );
        let matchmaker = Matchmaker::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
            config.matchmaking.clone(),
            &config.queue,
            config.phases.clone(),
            metrics.clone(),
        );
        let phases = Arc::new(PhaseMachine::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
            config.phases.clone(),
            queue.clone(),
            metrics.clone(),
        ));
        let outcomes = OutcomeEngine::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
            clubs,
            phases.clone(),
            config.outcome.clone(),
            metrics.clone(),
        );

        Ok(RankedEngine {
            config,
            store,
            publisher,
            clock,
            metrics,
            queue,
            matchmaker,
            phases,
            outcomes,
        })
    }
}

/// Ranked matchmaking and match lifecycle
pub struct RankedEngine {
    config: EngineConfig,
    store: Arc<dyn DocumentStore>,
    publisher: Arc<dyn NotificationPublisher>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    queue: QueueManager,
    matchmaker: Matchmaker,
    phases: Arc<PhaseMachine>,
    outcomes: OutcomeEngine,
}

impl RankedEngine {
    pub fn builder(config: EngineConfig) -> RankedEngineBuilder {
        RankedEngineBuilder {
            config,
            store: None,
            publisher: None,
            clubs: None,
            clock: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub async fn join_queue(&self, player_id: &str, region: &str) -> Result<QueueEntry> {
        self.queue.join(player_id, region).await
    }

    pub async fn leave_queue(&self, player_id: &str) -> Result<QueueEntry> {
        self.queue.leave(player_id).await
    }

    pub async fn submit_stage_ban(
        &self,
        match_id: MatchId,
        player_id: &str,
        stage: &str,
    ) -> Result<Match> {
        self.phases.submit_stage_ban(match_id, player_id, stage).await
    }

    pub async fn submit_captain_pick(
        &self,
        match_id: MatchId,
        player_id: &str,
        captain: &str,
    ) -> Result<Match> {
        self.phases
            .submit_captain_pick(match_id, player_id, captain)
            .await
    }

    pub async fn submit_host_choice(&self, match_id: MatchId, player_id: &str) -> Result<Match> {
        self.phases.submit_host_choice(match_id, player_id).await
    }

    pub async fn submit_room_code(
        &self,
        match_id: MatchId,
        host_id: &str,
        code: &str,
    ) -> Result<Match> {
        self.phases.submit_room_code(match_id, host_id, code).await
    }

    pub async fn report_score(
        &self,
        match_id: MatchId,
        player_id: &str,
        self_score: u32,
        opponent_score: u32,
    ) -> Result<ReportOutcome> {
        self.outcomes
            .report_score(match_id, player_id, self_score, opponent_score)
            .await
    }

    pub async fn cancel_match(&self, match_id: MatchId, reason: &str) -> Result<Match> {
        self.phases.cancel_match(match_id, reason).await
    }

    pub async fn fail_match(&self, match_id: MatchId, reason: &str) -> Result<Match> {
        self.phases.fail_match(match_id, reason).await
    }

    pub async fn transition_to(
        &self,
        match_id: MatchId,
        expected: Phase,
        next: Phase,
        reason: &str,
    ) -> Result<Match> {
        self.phases
            .transition_to(match_id, expected, next, reason)
            .await
    }

    pub async fn get_match(&self, match_id: MatchId) -> Result<Option<Match>> {
        self.store.get_match(match_id).await
    }

    pub async fn active_match_for(&self, player_id: &str) -> Result<Option<Match>> {
        self.store.active_match_for_player(player_id).await
    }

    pub async fn get_profile(&self, player_id: &str) -> Result<Option<PlayerProfile>> {
        self.store.get_profile(player_id).await
    }

    /// Run a command from the transport layer. Rejected commands are
    /// reported back to the issuing player as `CommandRejected`.
    pub async fn execute(&self, command: EngineCommand) -> Result<()> {
        let timer = self.metrics.start_timer();
        let name = command.name();
        let issuer = command.issuer().map(str::to_string);

        let result = self.dispatch(command).await;
        let elapsed = timer.stop();
        self.metrics.record_command(
            name,
            result.as_ref().err().map(|e| e.code()),
            elapsed,
        );

        if let Err(e) = &result {
            debug!("Command {} rejected: {}", name, e);
            let Some(issuer) = issuer else {
                return result;
            };
            let rejection = Notification::new(
                issuer.clone(),
                NotificationKind::CommandRejected,
                json!({
                    "command": name,
                    "code": e.code(),
                    "message": e.to_string(),
                }),
            );
            if let Err(publish_error) = self.publisher.publish(rejection).await {
                warn!(
                    "Failed to notify '{}' of rejected {}: {}",
                    issuer, name, publish_error
                );
            }
        }
        result
    }

    async fn dispatch(&self, command: EngineCommand) -> Result<()> {
        match command {
            EngineCommand::JoinQueue { player_id, region } => {
                self.join_queue(&player_id, &region).await.map(|_| ())
            }
            EngineCommand::LeaveQueue { player_id } => {
                self.leave_queue(&player_id).await.map(|_| ())
            }
            EngineCommand::SubmitStageBan {
                match_id,
                player_id,
                stage,
            } => self
                .submit_stage_ban(match_id, &player_id, &stage)
                .await
                .map(|_| ()),
            EngineCommand::SubmitCaptainPick {
                match_id,
                player_id,
                captain,
            } => self
                .submit_captain_pick(match_id, &player_id, &captain)
                .await
                .map(|_| ()),
            EngineCommand::SubmitHostChoice {
                match_id,
                player_id,
            } => self
                .submit_host_choice(match_id, &player_id)
                .await
                .map(|_| ()),
            EngineCommand::SubmitRoomCode {
                match_id,
                host_id,
                code,
            } => self
                .submit_room_code(match_id, &host_id, &code)
                .await
                .map(|_| ()),
            EngineCommand::ReportScore {
                match_id,
                player_id,
                self_score,
                opponent_score,
            } => self
                .report_score(match_id, &player_id, self_score, opponent_score)
                .await
                .map(|_| ()),
            EngineCommand::CancelMatch { match_id, reason } => {
                self.cancel_match(match_id, &reason).await.map(|_| ())
            }
        }
    }

    pub async fn run_matchmaking_pass(&self) -> Result<PassReport> {
        let timer = self.metrics.start_timer();
        let report = self.matchmaker.run_pass().await?;
        self.metrics.record_pass("matchmaking", timer.stop());
        Ok(report)
    }

    pub async fn run_queue_sweep(&self) -> Result<SweepReport> {
        let timer = self.metrics.start_timer();
        let report = self.queue.sweep().await?;
        self.metrics.record_pass("queue_sweep", timer.stop());
        Ok(report)
    }

    pub async fn run_deadline_sweep(&self) -> Result<DeadlineReport> {
        let timer = self.metrics.start_timer();
        let report = self.phases.run_deadline_sweep().await?;
        self.metrics.record_pass("deadline_sweep", timer.stop());
        Ok(report)
    }

    pub async fn run_reminder_sweep(&self) -> Result<usize> {
        let timer = self.metrics.start_timer();
        let reminded = self.outcomes.run_reminder_sweep().await?;
        self.metrics.record_pass("reminder_sweep", timer.stop());
        Ok(reminded)
    }

    pub async fn run_outcome_reconciliation(&self) -> Result<usize> {
        let timer = self.metrics.start_timer();
        let settled = self.outcomes.run_outcome_reconciliation().await?;
        self.metrics.record_pass("outcome_reconciliation", timer.stop());
        Ok(settled)
    }

    /// Current store counts; also refreshes the gauges
    pub async fn stats(&self) -> Result<StoreCounts> {
        let counts = self.store.counts().await?;
        self.metrics.update_from_counts(&counts);
        Ok(counts)
    }

    /// Log a one-line summary of the engine state
    pub async fn log_summary(&self) {
        match self.stats().await {
            Ok(counts) => info!(
                "Engine state: {} queued, {} open matches, {} total, {} pending reports, {} disputes",
                counts.queue_entries,
                counts.open_matches,
                counts.total_matches,
                counts.pending_reports,
                counts.disputes
            ),
            Err(e) => warn!("Failed to read engine state: {}", e),
        }
    }
}
