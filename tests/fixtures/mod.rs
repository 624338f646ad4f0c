//! Test fixtures shared by the integration and concurrency suites
#![allow(dead_code)]

use chrono::{Duration, Utc};
use ranked_room::amqp::publisher::MockNotificationPublisher;
use ranked_room::clock::ManualClock;
use ranked_room::club::InMemoryClubLeague;
use ranked_room::config::EngineConfig;
use ranked_room::engine::RankedEngine;
use ranked_room::store::{DocumentStore, InMemoryDocumentStore};
use ranked_room::types::{Match, Phase, PlayerProfile};
use std::sync::Arc;

/// A complete engine wired to in-memory collaborators and a manual clock
pub struct TestSystem {
    pub engine: Arc<RankedEngine>,
    pub store: Arc<InMemoryDocumentStore>,
    pub clock: Arc<ManualClock>,
    pub publisher: Arc<MockNotificationPublisher>,
    pub clubs: Arc<InMemoryClubLeague>,
}

/// Default config with hypercharge disabled so rep deltas are predictable
pub fn deterministic_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.matchmaking.hypercharge_probability = 0.0;
    config.phases.stages = vec![
        "Neon Harbor".to_string(),
        "Sky Ruins".to_string(),
        "Crystal Caverns".to_string(),
    ];
    config
}

pub fn create_test_system(profiles: Vec<PlayerProfile>) -> TestSystem {
    create_test_system_with(deterministic_config(), profiles, Vec::<String>::new())
}

pub fn create_test_system_with(
    config: EngineConfig,
    profiles: Vec<PlayerProfile>,
    clubs: Vec<impl Into<String>>,
) -> TestSystem {
    let store = Arc::new(InMemoryDocumentStore::with_profiles(profiles));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let publisher = Arc::new(MockNotificationPublisher::new());
    let clubs = Arc::new(InMemoryClubLeague::with_clubs(clubs));

    let engine = RankedEngine::builder(config)
        .store(store.clone())
        .publisher(publisher.clone())
        .clubs(clubs.clone())
        .clock(clock.clone())
        .build()
        .expect("engine should build");

    TestSystem {
        engine: Arc::new(engine),
        store,
        clock,
        publisher,
        clubs,
    }
}

pub fn profile(id: &str, rep: u32, region: &str) -> PlayerProfile {
    PlayerProfile::new(id, rep, region)
}

pub fn club_profile(id: &str, rep: u32, club: &str) -> PlayerProfile {
    let mut profile = PlayerProfile::new(id, rep, "NA");
    profile.club_id = Some(club.to_string());
    profile
}

impl TestSystem {
    /// Queue `first` then `second` one second apart and run a pass.
    /// `first` lands in slot 0.
    pub async fn pair(&self, first: &str, second: &str) -> Match {
        let first_region = self.region_of(first).await;
        let second_region = self.region_of(second).await;

        self.engine.join_queue(first, &first_region).await.unwrap();
        self.clock.advance(Duration::seconds(1));
        self.engine.join_queue(second, &second_region).await.unwrap();

        let report = self.engine.run_matchmaking_pass().await.unwrap();
        assert_eq!(report.created.len(), 1, "expected exactly one match");
        self.engine
            .get_match(report.created[0])
            .await
            .unwrap()
            .unwrap()
    }

    async fn region_of(&self, player_id: &str) -> String {
        self.store
            .get_profile(player_id)
            .await
            .unwrap()
            .map(|p| p.region)
            .unwrap_or_else(|| "NA".to_string())
    }

    /// Move the clock past the current phase deadline and run the sweep
    pub async fn expire_phase(&self, match_id: uuid::Uuid) -> Match {
        let current = self.engine.get_match(match_id).await.unwrap().unwrap();
        let deadline = current.phase_deadline.expect("phase has a deadline");
        self.clock.set(deadline + Duration::seconds(1));
        self.engine.run_deadline_sweep().await.unwrap();
        self.engine.get_match(match_id).await.unwrap().unwrap()
    }

    /// Walk a fresh match through every negotiation phase into ACTIVE
    pub async fn drive_to_active(&self, match_id: uuid::Uuid) -> Match {
        let current = self.expire_phase(match_id).await;
        assert_eq!(current.phase, Phase::StageSelect);

        let mut current = current;
        while current.phase == Phase::StageSelect {
            let player = current.participants[current.ban_turn].player_id.clone();
            let stage = current.remaining_stages()[0].clone();
            current = self
                .engine
                .submit_stage_ban(match_id, &player, &stage)
                .await
                .unwrap();
        }
        assert_eq!(current.phase, Phase::CaptainSelect);

        let [a, b] = current.player_ids();
        self.engine
            .submit_captain_pick(match_id, &a, "Aegis")
            .await
            .unwrap();
        let current = self
            .engine
            .submit_captain_pick(match_id, &b, "Blaze")
            .await
            .unwrap();
        assert_eq!(current.phase, Phase::HostSelect);

        let current = self.engine.submit_host_choice(match_id, &a).await.unwrap();
        assert_eq!(current.phase, Phase::RoomCode);

        let current = self
            .engine
            .submit_room_code(match_id, &a, "abc123")
            .await
            .unwrap();
        assert_eq!(current.phase, Phase::Active);
        current
    }
}
