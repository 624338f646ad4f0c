//! Metrics collection using Prometheus
//!
//! Every engine component records into one [`MetricsCollector`]. Each
//! collector owns its own registry, so tests can create as many as they like.

use crate::store::StoreCounts;
use crate::types::{Phase, RankChange};
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the ranked engine
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    service_metrics: ServiceMetrics,
    queue_metrics: QueueMetrics,
    match_metrics: MatchMetrics,
    outcome_metrics: OutcomeMetrics,
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    pub uptime_seconds: IntGauge,
    /// Commands received over AMQP, by command and status
    pub amqp_messages_total: IntCounterVec,
    /// Rejected commands, by error code
    pub amqp_errors_total: IntCounterVec,
    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,
    pub component_health: IntGaugeVec,
}

/// Queue metrics
#[derive(Clone)]
pub struct QueueMetrics {
    pub joins_total: IntCounter,
    pub leaves_total: IntCounter,
    pub rejections_total: IntCounterVec,
    pub expired_total: IntCounterVec,
    pub requeued_total: IntCounter,
    pub queue_depth: IntGauge,
    /// Time between joining and being paired
    pub wait_seconds: Histogram,
}

/// Match lifecycle metrics
#[derive(Clone)]
pub struct MatchMetrics {
    pub matches_created_total: IntCounterVec,
    pub hypercharged_total: IntCounter,
    pub phase_transitions_total: IntCounterVec,
    pub phase_timeouts_total: IntCounterVec,
    pub transition_conflicts_total: IntCounter,
    pub open_matches: IntGauge,
}

/// Reporting and rep metrics
#[derive(Clone)]
pub struct OutcomeMetrics {
    pub score_reports_total: IntCounter,
    pub disputes_total: IntCounter,
    pub reminders_total: IntCounter,
    pub matches_completed_total: IntCounter,
    pub matches_cancelled_total: IntCounter,
    pub matches_failed_total: IntCounter,
    pub rank_changes_total: IntCounterVec,
    pub rep_gain: Histogram,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Duration of scheduler passes, by pass name
    pub pass_duration: HistogramVec,
    /// Duration of command handling, by command and status
    pub command_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a new metrics collector with a custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let match_metrics = MatchMetrics::new(&registry)?;
        let outcome_metrics = OutcomeMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            queue_metrics,
            match_metrics,
            outcome_metrics,
            performance_metrics,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    pub fn matches(&self) -> &MatchMetrics {
        &self.match_metrics
    }

    pub fn outcome(&self) -> &OutcomeMetrics {
        &self.outcome_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Refresh gauges from store counts
    pub fn update_from_counts(&self, counts: &StoreCounts) {
        self.queue_metrics
            .queue_depth
            .set(counts.queue_entries as i64);
        self.match_metrics
            .open_matches
            .set(counts.open_matches as i64);
    }

    pub fn record_queue_join(&self) {
        self.queue_metrics.joins_total.inc();
        self.queue_metrics.queue_depth.inc();
    }

    pub fn record_queue_leave(&self) {
        self.queue_metrics.leaves_total.inc();
        self.queue_metrics.queue_depth.dec();
    }

    pub fn record_queue_rejection(&self, code: &str) {
        self.queue_metrics
            .rejections_total
            .with_label_values(&[code])
            .inc();
    }

    pub fn record_queue_expired(&self, reason: &str) {
        self.queue_metrics
            .expired_total
            .with_label_values(&[reason])
            .inc();
        self.queue_metrics.queue_depth.dec();
    }

    pub fn record_requeue(&self) {
        self.queue_metrics.requeued_total.inc();
        self.queue_metrics.queue_depth.inc();
    }

    /// Record a new match and how long its players waited
    pub fn record_match_created(&self, cross_region: bool, hypercharged: bool, waits: [Duration; 2]) {
        let scope = if cross_region {
            "cross_region"
        } else {
            "same_region"
        };
        self.match_metrics
            .matches_created_total
            .with_label_values(&[scope])
            .inc();
        if hypercharged {
            self.match_metrics.hypercharged_total.inc();
        }
        self.match_metrics.open_matches.inc();
        for wait in waits {
            self.queue_metrics.wait_seconds.observe(wait.as_secs_f64());
            self.queue_metrics.queue_depth.dec();
        }
    }

    pub fn record_phase_transition(&self, from: Phase, to: Phase) {
        self.match_metrics
            .phase_transitions_total
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();

        if to.is_terminal() {
            self.match_metrics.open_matches.dec();
        }
        match to {
            Phase::Completed => self.outcome_metrics.matches_completed_total.inc(),
            Phase::Cancelled => self.outcome_metrics.matches_cancelled_total.inc(),
            Phase::Failed => self.outcome_metrics.matches_failed_total.inc(),
            Phase::Disputed => self.outcome_metrics.disputes_total.inc(),
            _ => {}
        }
    }

    pub fn record_phase_timeout(&self, phase: Phase) {
        self.match_metrics
            .phase_timeouts_total
            .with_label_values(&[phase.as_str()])
            .inc();
    }

    pub fn record_transition_conflict(&self) {
        self.match_metrics.transition_conflicts_total.inc();
    }

    pub fn record_score_report(&self) {
        self.outcome_metrics.score_reports_total.inc();
    }

    pub fn record_reminder(&self) {
        self.outcome_metrics.reminders_total.inc();
    }

    pub fn record_rep_gain(&self, gain: i32) {
        self.outcome_metrics.rep_gain.observe(gain as f64);
    }

    pub fn record_rank_change(&self, change: &RankChange) {
        let direction = if change.is_promotion() { "up" } else { "down" };
        self.outcome_metrics
            .rank_changes_total
            .with_label_values(&[direction])
            .inc();
    }

    pub fn record_pass(&self, pass: &str, duration: Duration) {
        self.performance_metrics
            .pass_duration
            .with_label_values(&[pass])
            .observe(duration.as_secs_f64());
    }

    /// Record a command received over AMQP
    pub fn record_command(&self, command: &str, error_code: Option<&str>, duration: Duration) {
        let status = if error_code.is_some() { "error" } else { "success" };

        self.service_metrics
            .amqp_messages_total
            .with_label_values(&[command, status])
            .inc();

        if let Some(code) = error_code {
            self.service_metrics
                .amqp_errors_total
                .with_label_values(&[code])
                .inc();
        }

        self.performance_metrics
            .command_duration
            .with_label_values(&[command, status])
            .observe(duration.as_secs_f64());
    }

    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    pub fn update_component_health(&self, component: &str, healthy: bool) {
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(if healthy { 1 } else { 0 });
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("ranked_room_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let amqp_messages_total = IntCounterVec::new(
            Opts::new(
                "ranked_room_amqp_messages_total",
                "Total AMQP commands processed",
            ),
            &["command", "status"],
        )?;
        registry.register(Box::new(amqp_messages_total.clone()))?;

        let amqp_errors_total = IntCounterVec::new(
            Opts::new("ranked_room_amqp_errors_total", "Rejected AMQP commands"),
            &["code"],
        )?;
        registry.register(Box::new(amqp_errors_total.clone()))?;

        let health_status = IntGauge::new(
            "ranked_room_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("ranked_room_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            amqp_messages_total,
            amqp_errors_total,
            health_status,
            component_health,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let joins_total = IntCounter::new("ranked_room_queue_joins_total", "Successful queue joins")?;
        registry.register(Box::new(joins_total.clone()))?;

        let leaves_total = IntCounter::new("ranked_room_queue_leaves_total", "Voluntary queue leaves")?;
        registry.register(Box::new(leaves_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("ranked_room_queue_rejections_total", "Rejected queue joins"),
            &["reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let expired_total = IntCounterVec::new(
            Opts::new(
                "ranked_room_queue_expired_total",
                "Queue entries removed by the sweep",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(expired_total.clone()))?;

        let requeued_total = IntCounter::new(
            "ranked_room_queue_requeued_total",
            "Players requeued after a cancelled match",
        )?;
        registry.register(Box::new(requeued_total.clone()))?;

        let queue_depth = IntGauge::new("ranked_room_queue_depth", "Players currently queued")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ranked_room_queue_wait_seconds",
                "Time from joining the queue to being paired",
            )
            .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        registry.register(Box::new(wait_seconds.clone()))?;

        Ok(Self {
            joins_total,
            leaves_total,
            rejections_total,
            expired_total,
            requeued_total,
            queue_depth,
            wait_seconds,
        })
    }
}

impl MatchMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let matches_created_total = IntCounterVec::new(
            Opts::new("ranked_room_matches_created_total", "Matches created"),
            &["scope"],
        )?;
        registry.register(Box::new(matches_created_total.clone()))?;

        let hypercharged_total = IntCounter::new(
            "ranked_room_hypercharged_matches_total",
            "Matches flagged as hypercharged",
        )?;
        registry.register(Box::new(hypercharged_total.clone()))?;

        let phase_transitions_total = IntCounterVec::new(
            Opts::new(
                "ranked_room_phase_transitions_total",
                "Committed phase transitions",
            ),
            &["from", "to"],
        )?;
        registry.register(Box::new(phase_transitions_total.clone()))?;

        let phase_timeouts_total = IntCounterVec::new(
            Opts::new(
                "ranked_room_phase_timeouts_total",
                "Deadlines resolved by the engine",
            ),
            &["phase"],
        )?;
        registry.register(Box::new(phase_timeouts_total.clone()))?;

        let transition_conflicts_total = IntCounter::new(
            "ranked_room_transition_conflicts_total",
            "Match writes that lost a compare-and-swap race",
        )?;
        registry.register(Box::new(transition_conflicts_total.clone()))?;

        let open_matches = IntGauge::new("ranked_room_open_matches", "Non-terminal matches")?;
        registry.register(Box::new(open_matches.clone()))?;

        Ok(Self {
            matches_created_total,
            hypercharged_total,
            phase_transitions_total,
            phase_timeouts_total,
            transition_conflicts_total,
            open_matches,
        })
    }
}

impl OutcomeMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let score_reports_total =
            IntCounter::new("ranked_room_score_reports_total", "Accepted score reports")?;
        registry.register(Box::new(score_reports_total.clone()))?;

        let disputes_total = IntCounter::new("ranked_room_disputes_total", "Disputes opened")?;
        registry.register(Box::new(disputes_total.clone()))?;

        let reminders_total =
            IntCounter::new("ranked_room_reminders_total", "Score report reminders sent")?;
        registry.register(Box::new(reminders_total.clone()))?;

        let matches_completed_total =
            IntCounter::new("ranked_room_matches_completed_total", "Completed matches")?;
        registry.register(Box::new(matches_completed_total.clone()))?;

        let matches_cancelled_total =
            IntCounter::new("ranked_room_matches_cancelled_total", "Cancelled matches")?;
        registry.register(Box::new(matches_cancelled_total.clone()))?;

        let matches_failed_total =
            IntCounter::new("ranked_room_matches_failed_total", "Failed matches")?;
        registry.register(Box::new(matches_failed_total.clone()))?;

        let rank_changes_total = IntCounterVec::new(
            Opts::new("ranked_room_rank_changes_total", "Rank tier changes"),
            &["direction"],
        )?;
        registry.register(Box::new(rank_changes_total.clone()))?;

        let rep_gain = Histogram::with_opts(
            HistogramOpts::new("ranked_room_rep_gain", "Rep awarded to match winners")
                .buckets(vec![75.0, 85.0, 95.0, 105.0, 115.0, 125.0, 135.0, 145.0]),
        )?;
        registry.register(Box::new(rep_gain.clone()))?;

        Ok(Self {
            score_reports_total,
            disputes_total,
            reminders_total,
            matches_completed_total,
            matches_cancelled_total,
            matches_failed_total,
            rank_changes_total,
            rep_gain,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let pass_duration = HistogramVec::new(
            HistogramOpts::new(
                "ranked_room_pass_duration_seconds",
                "Scheduler pass duration",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["pass"],
        )?;
        registry.register(Box::new(pass_duration.clone()))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new(
                "ranked_room_command_duration_seconds",
                "Command handling duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["command", "status"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        Ok(Self {
            pass_duration,
            command_duration,
        })
    }
}
