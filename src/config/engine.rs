//! Engine tunables: queue ageing, scoring, phase deadlines and outcome handling

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// All settings the ranked engine itself reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub matchmaking: MatchmakingConfig,
    pub phases: PhaseConfig,
    pub outcome: OutcomeConfig,
}

/// Queue eligibility and age-out settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Entries older than this are removed by the sweep
    pub max_queue_age_seconds: u64,
    /// Entries that went unpaired this many passes are removed by the sweep
    pub max_match_attempts: u32,
    /// Players whose last completed match is older than this cannot queue
    pub inactivity_window_days: i64,
    pub sweep_interval_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_age_seconds: 600,
            max_match_attempts: 60,
            inactivity_window_days: 30,
            sweep_interval_seconds: 300,
        }
    }
}

impl QueueConfig {
    pub fn max_queue_age(&self) -> Duration {
        Duration::seconds(self.max_queue_age_seconds as i64)
    }

    pub fn inactivity_window(&self) -> Duration {
        Duration::days(self.inactivity_window_days)
    }
}

/// Pair scoring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    pub interval_seconds: u64,
    /// Pairs scoring at or above this are never matched
    pub acceptance_threshold: f64,
    /// Added to the score of pairs from different regions
    pub cross_region_penalty: f64,
    /// Rep difference that counts as maximally different
    pub rep_normalizer: f64,
    pub hypercharge_probability: f64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
            acceptance_threshold: 0.30,
            cross_region_penalty: 0.25,
            rep_normalizer: 1000.0,
            hypercharge_probability: 0.10,
        }
    }
}

/// What happens to participants when a match is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// No rep refund and no requeue
    #[default]
    None,
    /// Both participants are put back in the queue
    Requeue,
}

impl std::str::FromStr for CancellationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CancellationPolicy::None),
            "requeue" => Ok(CancellationPolicy::Requeue),
            other => Err(format!("unknown cancellation policy: {}", other)),
        }
    }
}

/// Phase deadlines, retry policy and the stage/captain catalogs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub pregame_seconds: u64,
    /// Per-turn deadline, restarted after every ban
    pub stage_select_seconds: u64,
    pub captain_select_seconds: u64,
    pub host_select_seconds: u64,
    pub room_code_seconds: u64,
    pub active_minutes: u64,
    pub deadline_sweep_interval_ms: u64,
    pub max_transition_retries: u32,
    pub retry_base_delay_ms: u64,
    pub cancellation_policy: CancellationPolicy,
    pub stages: Vec<String>,
    pub captains: Vec<String>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            pregame_seconds: 10,
            stage_select_seconds: 30,
            captain_select_seconds: 60,
            host_select_seconds: 45,
            room_code_seconds: 180,
            active_minutes: 90,
            deadline_sweep_interval_ms: 1000,
            max_transition_retries: 3,
            retry_base_delay_ms: 25,
            cancellation_policy: CancellationPolicy::None,
            stages: [
                "Neon Harbor",
                "Sky Ruins",
                "Crystal Caverns",
                "Sunken Temple",
                "Iron Foundry",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            captains: [
                "Aegis", "Blaze", "Cinder", "Drift", "Ember", "Flux", "Gale", "Halo",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl PhaseConfig {
    /// Deadline length for a phase, `None` for terminal phases
    pub fn phase_timeout(&self, phase: crate::types::Phase) -> Option<Duration> {
        use crate::types::Phase;
        let seconds = match phase {
            Phase::Pregame => self.pregame_seconds,
            Phase::StageSelect => self.stage_select_seconds,
            Phase::CaptainSelect => self.captain_select_seconds,
            Phase::HostSelect => self.host_select_seconds,
            Phase::RoomCode => self.room_code_seconds,
            Phase::Active => self.active_minutes * 60,
            _ => return None,
        };
        Some(Duration::seconds(seconds as i64))
    }

    pub fn deadline_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.deadline_sweep_interval_ms)
    }
}

/// Score reporting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeConfig {
    /// How long after the first report the opponent is reminded
    pub reminder_delay_seconds: u64,
    pub reminder_sweep_interval_seconds: u64,
    pub max_reported_score: u32,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            reminder_delay_seconds: 600,
            reminder_sweep_interval_seconds: 30,
            max_reported_score: 99,
        }
    }
}

impl OutcomeConfig {
    pub fn reminder_delay(&self) -> Duration {
        Duration::seconds(self.reminder_delay_seconds as i64)
    }
}
