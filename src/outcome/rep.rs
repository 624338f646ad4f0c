//! Rep arithmetic for completed matches
//!
//! Everything here is pure so it can be tested and benchmarked without a store.

use serde::{Deserialize, Serialize};

pub const BASE_GAIN: i32 = 75;
/// Rep gap worth one point of bonus or penalty
pub const REP_DIFF_STEP: u32 = 225;
pub const MAX_REP_DIFF_BONUS: i32 = 20;
pub const RUN_DIFF_MULTIPLIER: i32 = 3;
pub const MAX_RUN_DIFF_BONUS: i32 = 30;
pub const STREAK_MULTIPLIER: i32 = 2;
pub const MAX_STREAK_BONUS: i32 = 20;
/// Win streak at which the raised gain band applies
pub const HOT_STREAK: u32 = 10;
pub const GAIN_RANGE: (i32, i32) = (75, 125);
pub const HOT_STREAK_GAIN_RANGE: (i32, i32) = (95, 145);

pub const CLUB_BASE_GAIN: i32 = 70;
pub const MAX_CLUB_GAIN: i32 = 100;
pub const CLUB_LOSS: i32 = 10;

/// What the rep calculation looks at, taken from the match snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepInput {
    pub winner_rep: u32,
    pub loser_rep: u32,
    pub winner_score: u32,
    pub loser_score: u32,
    /// Winner's streak before this match
    pub winner_streak: u32,
    pub hypercharged: bool,
}

impl RepInput {
    pub fn run_differential(&self) -> u32 {
        self.winner_score.abs_diff(self.loser_score)
    }
}

/// Signed rep deltas for both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepChange {
    pub winner_delta: i32,
    pub loser_delta: i32,
}

fn run_diff_bonus(run_differential: u32) -> i32 {
    (run_differential.min(i32::MAX as u32) as i32)
        .saturating_mul(RUN_DIFF_MULTIPLIER)
        .min(MAX_RUN_DIFF_BONUS)
}

/// Rep won by the winner and lost by the loser
pub fn compute_rep_change(input: &RepInput) -> RepChange {
    let rep_gap = input.winner_rep.abs_diff(input.loser_rep);
    let rep_diff_bonus = ((rep_gap / REP_DIFF_STEP) as i32).min(MAX_REP_DIFF_BONUS);
    // Upsets pay more; beating a weaker player pays less.
    let rep_diff_bonus = if input.winner_rep < input.loser_rep {
        rep_diff_bonus
    } else {
        -rep_diff_bonus
    };

    let streak_bonus = (input.winner_streak.min(i32::MAX as u32) as i32)
        .saturating_mul(STREAK_MULTIPLIER)
        .min(MAX_STREAK_BONUS);

    let mut gain = BASE_GAIN + rep_diff_bonus + run_diff_bonus(input.run_differential()) + streak_bonus;
    if input.hypercharged {
        gain = gain * 3 / 2;
    }

    let (min, max) = if input.winner_streak >= HOT_STREAK {
        HOT_STREAK_GAIN_RANGE
    } else {
        GAIN_RANGE
    };
    let gain = gain.clamp(min, max);

    RepChange {
        winner_delta: gain,
        loser_delta: -(gain * 4 / 5),
    }
}

/// League rep for the winning club
pub fn club_rep_gain(run_differential: u32) -> i32 {
    (CLUB_BASE_GAIN + run_diff_bonus(run_differential)).min(MAX_CLUB_GAIN)
}

/// Apply a signed delta to a cumulative rep value, flooring at zero
pub fn apply_delta(rep: u32, delta: i32) -> u32 {
    if delta >= 0 {
        rep.saturating_add(delta as u32)
    } else {
        rep.saturating_sub(delta.unsigned_abs())
    }
}
