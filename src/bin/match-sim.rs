//! Match Simulator CLI Tool
//!
//! Runs the full engine in memory against synthetic players and prints the
//! resulting ladder. Time is simulated, so hours of play finish in seconds.
//!
//! Usage:
//!   cargo run --bin match-sim -- --players 32 --ticks 500
//!   cargo run --bin match-sim -- --players 16 --dispute-rate 0.1 --seed 7

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use ranked_room::amqp::publisher::MockNotificationPublisher;
use ranked_room::clock::ManualClock;
use ranked_room::club::InMemoryClubLeague;
use ranked_room::config::{CancellationPolicy, EngineConfig};
use ranked_room::engine::RankedEngine;
use ranked_room::store::{DocumentStore, InMemoryDocumentStore};
use ranked_room::types::{Match, NotificationKind, Phase, PlayerProfile};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "match-sim")]
#[command(about = "In-memory simulation of the ranked ladder")]
struct Cli {
    /// Number of synthetic players
    #[arg(short, long, default_value = "24")]
    players: usize,

    /// Simulated ticks to run
    #[arg(short, long, default_value = "400")]
    ticks: u32,

    /// Simulated seconds per tick
    #[arg(long, default_value = "5")]
    tick_seconds: i64,

    /// Regions players are spread across
    #[arg(long, value_delimiter = ',', default_value = "NA,EU")]
    regions: Vec<String>,

    /// Clubs players are spread across; empty disables the club league
    #[arg(long, value_delimiter = ',', default_value = "Rockets,Comets,Meteors")]
    clubs: Vec<String>,

    /// Chance that a player claims the win regardless of the real result
    #[arg(long, default_value = "0.05")]
    dispute_rate: f64,

    /// Chance per tick that a player ignores their current phase
    #[arg(long, default_value = "0.1")]
    idle_rate: f64,

    /// Put players back in the queue when their match is cancelled
    #[arg(long)]
    requeue: bool,

    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Log level for engine output
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Hidden strength that decides who actually wins
struct SimPlayer {
    id: String,
    region: String,
    skill: f64,
}

struct Simulation {
    engine: RankedEngine,
    clock: Arc<ManualClock>,
    clubs: Arc<InMemoryClubLeague>,
    publisher: Arc<MockNotificationPublisher>,
    players: Vec<SimPlayer>,
    rng: StdRng,
    cli: Cli,
}

impl Simulation {
    fn new(cli: Cli) -> Result<Self> {
        let mut rng = match cli.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let regions = if cli.regions.is_empty() {
            vec!["NA".to_string()]
        } else {
            cli.regions.clone()
        };

        let mut players = Vec::with_capacity(cli.players);
        let mut profiles = Vec::with_capacity(cli.players);
        for i in 0..cli.players {
            let region = regions[i % regions.len()].clone();
            let id = format!("player-{:03}", i + 1);
            let rep = rng.gen_range(0..3000);
            let mut profile = PlayerProfile::new(id.clone(), rep, region.clone());
            if !cli.clubs.is_empty() {
                profile.club_id = Some(cli.clubs[i % cli.clubs.len()].clone());
            }
            profiles.push(profile);
            players.push(SimPlayer {
                id,
                region,
                skill: rng.gen_range(0.5..2.0),
            });
        }

        let mut config = EngineConfig::default();
        if cli.requeue {
            config.phases.cancellation_policy = CancellationPolicy::Requeue;
        }

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let clubs = Arc::new(InMemoryClubLeague::with_clubs(cli.clubs.iter().cloned()));
        let publisher = Arc::new(MockNotificationPublisher::new());
        let engine = RankedEngine::builder(config)
            .store(Arc::new(InMemoryDocumentStore::with_profiles(profiles)))
            .publisher(publisher.clone())
            .clubs(clubs.clone())
            .clock(clock.clone())
            .build()
            .context("Failed to build engine")?;

        Ok(Self {
            engine,
            clock,
            clubs,
            publisher,
            players,
            rng,
            cli,
        })
    }

    async fn run(&mut self) -> Result<()> {
        for tick in 0..self.cli.ticks {
            self.queue_idle_players().await?;
            let report = self.engine.run_matchmaking_pass().await?;
            if !report.created.is_empty() {
                debug!("Tick {}: {} matches created", tick, report.created.len());
            }

            for current in self.engine.store().list_open_matches().await? {
                self.act(&current).await;
            }

            self.clock
                .advance(ChronoDuration::seconds(self.cli.tick_seconds));
            self.engine.run_deadline_sweep().await?;
            self.engine.run_queue_sweep().await?;
            self.engine.run_reminder_sweep().await?;
            self.engine.run_outcome_reconciliation().await?;
        }
        Ok(())
    }

    async fn queue_idle_players(&mut self) -> Result<()> {
        for player in &self.players {
            if self.engine.active_match_for(&player.id).await?.is_some()
                || self.engine.store().get_queue_entry(&player.id).await?.is_some()
            {
                continue;
            }
            if let Err(e) = self.engine.join_queue(&player.id, &player.region).await {
                debug!("{} could not queue: {}", player.id, e);
            }
        }
        Ok(())
    }

    /// Play one move for whoever is expected to act in `current`
    async fn act(&mut self, current: &Match) {
        if self.rng.gen_bool(self.cli.idle_rate.clamp(0.0, 1.0)) {
            return;
        }

        let match_id = current.match_id;
        let result = match current.phase {
            Phase::StageSelect => {
                let player = current.participants[current.ban_turn].player_id.clone();
                let stages = current.remaining_stages();
                match stages.choose(&mut self.rng) {
                    Some(stage) => self
                        .engine
                        .submit_stage_ban(match_id, &player, stage)
                        .await
                        .map(|_| ()),
                    None => Ok(()),
                }
            }
            Phase::CaptainSelect => {
                let captains = self.engine.config().phases.captains.clone();
                let waiting = current
                    .participants
                    .iter()
                    .find(|p| !current.captain_picks.contains_key(&p.player_id))
                    .map(|p| p.player_id.clone());
                match (waiting, captains.choose(&mut self.rng)) {
                    (Some(player), Some(captain)) => self
                        .engine
                        .submit_captain_pick(match_id, &player, captain)
                        .await
                        .map(|_| ()),
                    _ => Ok(()),
                }
            }
            Phase::HostSelect => {
                let host = current.participants[self.rng.gen_range(0..2)].player_id.clone();
                self.engine
                    .submit_host_choice(match_id, &host)
                    .await
                    .map(|_| ())
            }
            Phase::RoomCode => match &current.host_id {
                Some(host) => {
                    let code = format!("SIM{:05}", self.rng.gen_range(0..100_000));
                    self.engine
                        .submit_room_code(match_id, host, &code)
                        .await
                        .map(|_| ())
                }
                None => Ok(()),
            },
            Phase::Active => self.report(current).await,
            _ => Ok(()),
        };

        if let Err(e) = result {
            debug!("Move in match {} rejected: {}", match_id, e);
        }
    }

    async fn report(&mut self, current: &Match) -> ranked_room::Result<()> {
        let reports = self
            .engine
            .store()
            .score_reports_for_match(current.match_id)
            .await?;
        let [a, b] = current.player_ids();
        let skill_a = self.skill_of(&a);
        let skill_b = self.skill_of(&b);

        // Both players report the same game, so derive it from the match id
        let mut game_rng = StdRng::seed_from_u64(current.match_id.as_u128() as u64);
        let a_wins = game_rng.gen_bool(skill_a / (skill_a + skill_b));
        let loser_score = game_rng.gen_range(0..15);
        let (a_score, b_score) = if a_wins {
            (15, loser_score)
        } else {
            (loser_score, 15)
        };

        for (player, own, other) in [(&a, a_score, b_score), (&b, b_score, a_score)] {
            if reports.iter().any(|r| &r.reporter_id == player) {
                continue;
            }
            let (own, other) = if own < other && self.rng.gen_bool(self.cli.dispute_rate) {
                (other, own)
            } else {
                (own, other)
            };
            self.engine
                .report_score(current.match_id, player, own, other)
                .await?;
        }
        Ok(())
    }

    fn skill_of(&self, player_id: &str) -> f64 {
        self.players
            .iter()
            .find(|p| p.id == player_id)
            .map(|p| p.skill)
            .unwrap_or(1.0)
    }

    async fn print_ladder(&self) -> Result<()> {
        let mut ladder = Vec::new();
        for player in &self.players {
            if let Some(profile) = self.engine.get_profile(&player.id).await? {
                ladder.push((profile, player.skill));
            }
        }
        ladder.sort_by(|a, b| b.0.rep.cmp(&a.0.rep));

        println!();
        println!(
            "{:<4} {:<12} {:<6} {:>6} {:<10} {:>4} {:>4} {:>6} {:>6}",
            "#", "player", "region", "rep", "tier", "W", "L", "streak", "skill"
        );
        for (rank, (profile, skill)) in ladder.iter().enumerate() {
            println!(
                "{:<4} {:<12} {:<6} {:>6} {:<10} {:>4} {:>4} {:>6} {:>6.2}",
                rank + 1,
                profile.player_id,
                profile.region,
                profile.rep,
                profile.rank_tier().to_string(),
                profile.wins,
                profile.losses,
                profile.win_streak,
                skill
            );
        }

        let standings = self.clubs.standings()?;
        if !standings.is_empty() {
            println!();
            println!("{:<12} {:>6}", "club", "rep");
            for (club, rep) in standings {
                println!("{:<12} {:>6}", club, rep);
            }
        }

        let matches = self.engine.store().list_matches().await?;
        let count = |phase: Phase| matches.iter().filter(|m| m.phase == phase).count();
        println!();
        println!(
            "matches: {} total, {} completed, {} disputed, {} cancelled, {} failed, {} open",
            matches.len(),
            count(Phase::Completed),
            count(Phase::Disputed),
            count(Phase::Cancelled),
            count(Phase::Failed),
            matches.iter().filter(|m| !m.phase.is_terminal()).count()
        );
        println!(
            "notifications: {} sent, {} rank ups, {} rank downs, {} reminders",
            self.publisher.notifications().len(),
            self.publisher.count_of(NotificationKind::RankUp),
            self.publisher.count_of(NotificationKind::RankDown),
            self.publisher.count_of(NotificationKind::Reminder)
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .with_target(false)
        .init();

    info!(
        "Simulating {} players for {} ticks of {}s",
        cli.players, cli.ticks, cli.tick_seconds
    );

    let mut simulation = Simulation::new(cli)?;
    simulation.run().await?;
    simulation.print_ladder().await?;

    Ok(())
}
