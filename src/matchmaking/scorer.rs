//! Pairwise compatibility scoring and pair selection
//!
//! Scores are in [0, 1] before the region penalty; lower is a better match.

use crate::config::MatchmakingConfig;
use crate::types::{PlayerId, QueueEntry, RankTier};
use crate::utils::normalized_difference;
use chrono::Duration;
use std::collections::HashSet;

/// Relative weights of the score components
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub rep: f64,
    pub tier: f64,
    pub wait: f64,
    pub win_rate: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            rep: 0.4,
            tier: 0.3,
            wait: 0.2,
            win_rate: 0.1,
        }
    }
}

/// Scores how well two queued players fit together (lower = better fit)
pub trait PairScorer: Send + Sync {
    fn score(&self, a: &QueueEntry, b: &QueueEntry) -> f64;
}

/// Weighted sum of normalized rep, tier, wait-time and win-rate differences
#[derive(Debug, Clone)]
pub struct WeightedPairScorer {
    weights: ScoreWeights,
    rep_normalizer: f64,
    max_wait: Duration,
}

impl WeightedPairScorer {
    pub fn new(weights: ScoreWeights, rep_normalizer: f64, max_wait: Duration) -> Self {
        Self {
            weights,
            rep_normalizer,
            max_wait,
        }
    }

    pub fn from_config(config: &MatchmakingConfig, max_wait: Duration) -> Self {
        Self::new(ScoreWeights::default(), config.rep_normalizer, max_wait)
    }
}

impl PairScorer for WeightedPairScorer {
    fn score(&self, a: &QueueEntry, b: &QueueEntry) -> f64 {
        let rep = normalized_difference(a.rep as f64, b.rep as f64, self.rep_normalizer);

        let max_tier = RankTier::Legendary.points() as f64;
        let tier = normalized_difference(
            a.rank_tier.points() as f64,
            b.rank_tier.points() as f64,
            max_tier,
        );

        // Both waits are measured to the same instant, so their difference
        // is the difference of join times.
        let wait_gap = (a.joined_at - b.joined_at).num_milliseconds() as f64;
        let wait = normalized_difference(wait_gap, 0.0, self.max_wait.num_milliseconds() as f64);

        let win_rate = (a.win_rate - b.win_rate).abs().clamp(0.0, 1.0);

        self.weights.rep * rep
            + self.weights.tier * tier
            + self.weights.wait * wait
            + self.weights.win_rate * win_rate
    }
}

/// A selected pair; `first` is the earlier joiner
#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    pub first: QueueEntry,
    pub second: QueueEntry,
    pub score: f64,
    pub cross_region: bool,
}

struct Candidate {
    a: usize,
    b: usize,
    score: f64,
    cross_region: bool,
}

/// Choose disjoint pairs from the queue.
///
/// Same-region pairs below `threshold` are considered first. A player only
/// gets cross-region candidates (with `cross_region_penalty` added) when they
/// have no same-region candidate below the threshold. Candidates are then
/// claimed greedily in ascending score, ties going to the pair whose earlier
/// member joined first; no player is claimed twice.
pub fn select_pairs(
    entries: &[QueueEntry],
    scorer: &dyn PairScorer,
    threshold: f64,
    cross_region_penalty: f64,
) -> Vec<Pairing> {
    let mut candidates = Vec::new();
    let mut has_local_option = vec![false; entries.len()];

    for a in 0..entries.len() {
        for b in (a + 1)..entries.len() {
            if entries[a].region != entries[b].region {
                continue;
            }
            let score = scorer.score(&entries[a], &entries[b]);
            if score < threshold {
                has_local_option[a] = true;
                has_local_option[b] = true;
                candidates.push(Candidate {
                    a,
                    b,
                    score,
                    cross_region: false,
                });
            }
        }
    }

    for a in 0..entries.len() {
        if has_local_option[a] {
            continue;
        }
        for b in (a + 1)..entries.len() {
            if has_local_option[b] || entries[a].region == entries[b].region {
                continue;
            }
            let score = scorer.score(&entries[a], &entries[b]) + cross_region_penalty;
            if score < threshold {
                candidates.push(Candidate {
                    a,
                    b,
                    score,
                    cross_region: true,
                });
            }
        }
    }

    candidates.sort_by(|x, y| {
        x.score
            .total_cmp(&y.score)
            .then_with(|| earliest_join(entries, x).cmp(&earliest_join(entries, y)))
            .then_with(|| (x.a, x.b).cmp(&(y.a, y.b)))
    });

    let mut claimed: HashSet<PlayerId> = HashSet::new();
    let mut pairings = Vec::new();
    for candidate in candidates {
        let (a, b) = (&entries[candidate.a], &entries[candidate.b]);
        if claimed.contains(&a.player_id) || claimed.contains(&b.player_id) {
            continue;
        }
        claimed.insert(a.player_id.clone());
        claimed.insert(b.player_id.clone());

        let (first, second) = if (b.joined_at, &b.player_id) < (a.joined_at, &a.player_id) {
            (b.clone(), a.clone())
        } else {
            (a.clone(), b.clone())
        };
        pairings.push(Pairing {
            first,
            second,
            score: candidate.score,
            cross_region: candidate.cross_region,
        });
    }

    pairings
}

fn earliest_join(entries: &[QueueEntry], candidate: &Candidate) -> chrono::DateTime<chrono::Utc> {
    entries[candidate.a]
        .joined_at
        .min(entries[candidate.b].joined_at)
}
