//! Performance benchmarks for pair scoring, rep calculation and full passes

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ranked_room::amqp::publisher::MockNotificationPublisher;
use ranked_room::config::EngineConfig;
use ranked_room::engine::RankedEngine;
use ranked_room::matchmaking::{select_pairs, ScoreWeights, WeightedPairScorer};
use ranked_room::outcome::{compute_rep_change, RepInput};
use ranked_room::store::InMemoryDocumentStore;
use ranked_room::types::{PlayerProfile, QueueEntry, RankTier};
use std::sync::Arc;

fn queue_entries(count: usize) -> Vec<QueueEntry> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let rep = 800 + (i as u32 * 37) % 1600;
            QueueEntry {
                player_id: format!("player-{}", i),
                region: if i % 3 == 0 { "EU" } else { "NA" }.to_string(),
                rep,
                rank_tier: RankTier::for_rep(rep),
                win_streak: (i % 5) as u32,
                win_rate: (i % 10) as f64 / 10.0,
                joined_at: now - Duration::seconds((i % 120) as i64),
                match_attempts: 0,
            }
        })
        .collect()
}

fn bench_select_pairs(c: &mut Criterion) {
    let scorer = WeightedPairScorer::new(ScoreWeights::default(), 1000.0, Duration::seconds(600));
    let mut group = c.benchmark_group("select_pairs");

    for size in [16, 64, 256] {
        let entries = queue_entries(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &entries, |b, entries| {
            b.iter(|| select_pairs(black_box(entries), &scorer, 0.30, 0.25))
        });
    }

    group.finish();
}

fn bench_rep_change(c: &mut Criterion) {
    let input = RepInput {
        winner_rep: 1000,
        loser_rep: 1200,
        winner_score: 13,
        loser_score: 2,
        winner_streak: 4,
        hypercharged: false,
    };

    c.bench_function("compute_rep_change", |b| {
        b.iter(|| compute_rep_change(black_box(&input)))
    });
}

fn bench_matchmaking_pass(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("matchmaking_pass_64_players", |b| {
        b.iter(|| {
            rt.block_on(async {
                let profiles: Vec<PlayerProfile> = (0..64)
                    .map(|i| PlayerProfile::new(format!("player-{}", i), 1000 + i * 15, "NA"))
                    .collect();
                let ids: Vec<String> = profiles.iter().map(|p| p.player_id.clone()).collect();
                let engine = RankedEngine::builder(EngineConfig::default())
                    .store(Arc::new(InMemoryDocumentStore::with_profiles(profiles)))
                    .publisher(Arc::new(MockNotificationPublisher::new()))
                    .build()
                    .unwrap();

                for id in &ids {
                    engine.join_queue(id, "NA").await.unwrap();
                }
                black_box(engine.run_matchmaking_pass().await.unwrap())
            })
        });
    });
}

criterion_group!(
    benches,
    bench_select_pairs,
    bench_rep_change,
    bench_matchmaking_pass
);
criterion_main!(benches);
