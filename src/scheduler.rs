//! Timer-driven engine passes
//!
//! Each pass runs on its own interval task. Passes are stateless: they
//! re-read the store every tick, so a tick that fails is simply retried on
//! the next one.

use crate::config::EngineConfig;
use crate::engine::RankedEngine;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Intervals for each pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerIntervals {
    pub matchmaking: Duration,
    pub queue_sweep: Duration,
    pub deadline_sweep: Duration,
    pub reminder_sweep: Duration,
    pub stats: Duration,
}

impl SchedulerIntervals {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            matchmaking: Duration::from_secs(config.matchmaking.interval_seconds.max(1)),
            queue_sweep: Duration::from_secs(config.queue.sweep_interval_seconds.max(1)),
            deadline_sweep: config.phases.deadline_sweep_interval().max(Duration::from_millis(10)),
            reminder_sweep: Duration::from_secs(
                config.outcome.reminder_sweep_interval_seconds.max(1),
            ),
            stats: Duration::from_secs(30),
        }
    }
}

/// Owns the background tasks that drive the engine
pub struct Scheduler {
    engine: Arc<RankedEngine>,
    intervals: SchedulerIntervals,
    is_running: Arc<RwLock<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(engine: Arc<RankedEngine>) -> Self {
        let intervals = SchedulerIntervals::from_config(engine.config());
        Self::with_intervals(engine, intervals)
    }

    pub fn with_intervals(engine: Arc<RankedEngine>, intervals: SchedulerIntervals) -> Self {
        Self {
            engine,
            intervals,
            is_running: Arc::new(RwLock::new(false)),
            tasks: Vec::new(),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Spawn one interval task per pass
    pub async fn start(&mut self) {
        if self.is_running().await {
            warn!("Scheduler already running");
            return;
        }
        *self.is_running.write().await = true;

        let intervals = self.intervals;
        self.spawn_pass("matchmaking", intervals.matchmaking, |engine| async move {
            let report = engine.run_matchmaking_pass().await?;
            if !report.created.is_empty() {
                debug!(
                    "Matchmaking pass created {} matches, {} left waiting",
                    report.created.len(),
                    report.unmatched
                );
            }
            Ok(())
        });
        self.spawn_pass("queue_sweep", intervals.queue_sweep, |engine| async move {
            engine.run_queue_sweep().await.map(|_| ())
        });
        self.spawn_pass("deadline_sweep", intervals.deadline_sweep, |engine| async move {
            engine.run_deadline_sweep().await.map(|_| ())
        });
        self.spawn_pass("reminder_sweep", intervals.reminder_sweep, |engine| async move {
            engine.run_reminder_sweep().await?;
            engine.run_outcome_reconciliation().await.map(|_| ())
        });
        self.spawn_pass("stats", intervals.stats, |engine| async move {
            engine.stats().await.map(|_| ())
        });

        info!("Scheduler started {} passes", self.tasks.len());
    }

    fn spawn_pass<F, Fut>(&mut self, name: &'static str, period: Duration, pass: F)
    where
        F: Fn(Arc<RankedEngine>) -> Fut + Send + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let engine = self.engine.clone();
        let is_running = self.is_running.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!("{} task started ({:?} interval)", name, period);

            loop {
                interval.tick().await;
                if !*is_running.read().await {
                    break;
                }
                if let Err(e) = pass(engine.clone()).await {
                    warn!("{} pass failed: {}", name, e);
                }
            }

            debug!("{} task stopped", name);
        }));
    }

    /// Stop all passes; an in-flight pass is aborted
    pub async fn stop(&mut self) {
        *self.is_running.write().await = false;

        let count = self.tasks.len();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if count > 0 {
            info!("Scheduler stopped {} passes", count);
        }
    }
}
