//! Integration tests for the ranked-room engine
//!
//! These tests drive the public engine API end to end:
//! - Queueing and pairing
//! - Phase negotiation and deadline expiry
//! - Score reporting, disputes and rep/club updates
//! - Command rejection and cancellation policies

mod fixtures;

use chrono::Duration;
use ranked_room::amqp::messages::EngineCommand;
use ranked_room::config::CancellationPolicy;
use ranked_room::error::EngineError;
use ranked_room::outcome::ReportOutcome;
use ranked_room::store::DocumentStore;
use ranked_room::types::{NotificationKind, Phase, RankTier};
use tokio_test::{assert_err, assert_ok};

use fixtures::{
    club_profile, create_test_system, create_test_system_with, deterministic_config, profile,
};

#[tokio::test]
async fn test_similar_players_pair_in_one_pass() {
    let system = create_test_system(vec![profile("a", 1000, "NA"), profile("b", 1050, "NA")]);

    let m = system.pair("a", "b").await;

    assert_eq!(m.phase, Phase::Pregame);
    assert_eq!(m.participants[0].player_id, "a");
    assert_eq!(m.participants[1].player_id, "b");
    assert!(m.phase_deadline.is_some());
    assert!(system.store.list_queue_entries().await.unwrap().is_empty());

    for player in ["a", "b"] {
        let found = system.publisher.notifications_for(player);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, NotificationKind::MatchFound);
    }
}

#[tokio::test]
async fn test_distant_players_stay_queued() {
    let system = create_test_system(vec![profile("low", 0, "NA"), profile("high", 5600, "NA")]);

    assert_ok!(system.engine.join_queue("low", "NA").await);
    assert_ok!(system.engine.join_queue("high", "NA").await);
    let report = system.engine.run_matchmaking_pass().await.unwrap();

    assert!(report.created.is_empty());
    assert_eq!(report.unmatched, 2);
    let entry = system.store.get_queue_entry("low").await.unwrap().unwrap();
    assert_eq!(entry.match_attempts, 1);
}

#[tokio::test]
async fn test_cross_region_pair_when_no_local_option() {
    let system = create_test_system(vec![profile("na", 1000, "NA"), profile("eu", 1000, "EU")]);

    let m = system.pair("na", "eu").await;
    assert_eq!(m.participants[0].region, "NA");
    assert_eq!(m.participants[1].region, "EU");
}

#[tokio::test]
async fn test_no_double_booking() {
    let system = create_test_system(vec![profile("a", 1000, "NA"), profile("b", 1000, "NA")]);

    assert_ok!(system.engine.join_queue("a", "NA").await);
    let err = assert_err!(system.engine.join_queue("a", "NA").await);
    assert!(matches!(err, EngineError::AlreadyQueued { .. }));

    system.clock.advance(Duration::seconds(1));
    assert_ok!(system.engine.join_queue("b", "NA").await);
    system.engine.run_matchmaking_pass().await.unwrap();

    let err = assert_err!(system.engine.join_queue("a", "NA").await);
    assert!(matches!(err, EngineError::AlreadyInMatch { .. }));
}

#[tokio::test]
async fn test_full_match_lifecycle_applies_rep() {
    let system = create_test_system(vec![profile("a", 1000, "NA"), profile("b", 1200, "NA")]);
    let m = system.pair("a", "b").await;
    system.drive_to_active(m.match_id).await;

    let first = system.engine.report_score(m.match_id, "a", 13, 2).await.unwrap();
    assert_eq!(first, ReportOutcome::AwaitingOpponent);

    let second = system.engine.report_score(m.match_id, "b", 2, 13).await.unwrap();
    let outcome = match second {
        ReportOutcome::Completed(outcome) => outcome,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(outcome.winner_id, "a");
    assert_eq!(outcome.winner_rep_delta, 105);
    assert_eq!(outcome.loser_rep_delta, -84);

    let winner = system.engine.get_profile("a").await.unwrap().unwrap();
    let loser = system.engine.get_profile("b").await.unwrap().unwrap();
    assert_eq!(winner.rep, 1105);
    assert_eq!((winner.wins, winner.win_streak), (1, 1));
    assert!(winner.last_match_at.is_some());
    assert_eq!(loser.rep, 1116);
    assert_eq!((loser.losses, loser.win_streak), (1, 0));

    let stored = system.engine.get_match(m.match_id).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Completed);
    assert_eq!(stored.outcome, Some(outcome));
    assert!(system
        .store
        .score_reports_for_match(m.match_id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(system.publisher.count_of(NotificationKind::MatchComplete), 2);

    // Both players are free to queue again
    assert_ok!(system.engine.join_queue("a", "NA").await);
    assert_ok!(system.engine.join_queue("b", "NA").await);
}

#[tokio::test]
async fn test_disagreeing_reports_open_dispute() {
    let system = create_test_system(vec![profile("a", 1000, "NA"), profile("b", 1000, "NA")]);
    let m = system.pair("a", "b").await;
    system.drive_to_active(m.match_id).await;

    system.engine.report_score(m.match_id, "a", 13, 2).await.unwrap();
    let result = system.engine.report_score(m.match_id, "b", 13, 5).await.unwrap();
    assert!(matches!(result, ReportOutcome::Disputed { .. }));

    let stored = system.engine.get_match(m.match_id).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Disputed);

    let disputes = system.store.list_disputes().await.unwrap();
    assert_eq!(disputes.len(), 1);
    assert_eq!(disputes[0].reports[0].reporter_id, "a");
    assert_eq!(disputes[0].reports[1].reporter_id, "b");
    assert_eq!(system.publisher.count_of(NotificationKind::DisputeOpened), 2);

    // No rep moves on a dispute
    let a = system.engine.get_profile("a").await.unwrap().unwrap();
    assert_eq!((a.rep, a.wins, a.losses), (1000, 0, 0));
}

#[tokio::test]
async fn test_stage_select_expiry_auto_bans_for_player_on_turn() {
    let system = create_test_system(vec![profile("a", 1000, "NA"), profile("b", 1000, "NA")]);
    let m = system.pair("a", "b").await;

    let m = system.expire_phase(m.match_id).await;
    assert_eq!(m.phase, Phase::StageSelect);
    assert_eq!(m.ban_turn, 0);

    let m = system.expire_phase(m.match_id).await;
    assert_eq!(m.phase, Phase::StageSelect);
    assert_eq!(m.stage_bans.len(), 1);
    assert_eq!(m.stage_bans[0].player_id, "a");
    assert!(m.stage_bans[0].automatic);
    assert_eq!(m.ban_turn, 1);
    assert_eq!(m.remaining_stages().len(), 2);
}

#[tokio::test]
async fn test_room_code_expiry_cancels_without_rep_change() {
    let system = create_test_system(vec![profile("a", 1000, "NA"), profile("b", 1000, "NA")]);
    let m = system.pair("a", "b").await;

    let mut current = system.expire_phase(m.match_id).await;
    while current.phase != Phase::RoomCode {
        current = system.expire_phase(m.match_id).await;
        assert!(!current.phase.is_terminal());
    }
    assert!(current.host_id.is_some());
    assert!(current.selected_stage.is_some());
    assert_eq!(current.captain_picks.len(), 2);

    let cancelled = system.expire_phase(m.match_id).await;
    assert_eq!(cancelled.phase, Phase::Cancelled);
    assert!(cancelled.terminal_reason.is_some());
    assert!(cancelled.outcome.is_none());
    assert_eq!(system.publisher.count_of(NotificationKind::MatchCancelled), 2);

    for player in ["a", "b"] {
        let p = system.engine.get_profile(player).await.unwrap().unwrap();
        assert_eq!(p.rep, 1000);
        assert!(system.engine.active_match_for(player).await.unwrap().is_none());
    }
    assert!(system.store.list_queue_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_requeue_policy_returns_players_to_queue() {
    let mut config = deterministic_config();
    config.phases.cancellation_policy = CancellationPolicy::Requeue;
    let system = create_test_system_with(
        config,
        vec![profile("a", 1000, "NA"), profile("b", 1000, "NA")],
        Vec::<String>::new(),
    );
    let m = system.pair("a", "b").await;
    system.drive_to_active(m.match_id).await;

    let cancelled = system
        .engine
        .cancel_match(m.match_id, "host left")
        .await
        .unwrap();
    assert_eq!(cancelled.phase, Phase::Cancelled);

    let queued = system.store.list_queue_entries().await.unwrap();
    assert_eq!(queued.len(), 2);
}

#[tokio::test]
async fn test_club_rep_forwarded_between_clubs() {
    let system = create_test_system_with(
        deterministic_config(),
        vec![club_profile("a", 1000, "Alpha"), club_profile("b", 1200, "Beta")],
        vec!["Alpha", "Beta"],
    );
    let m = system.pair("a", "b").await;
    system.drive_to_active(m.match_id).await;

    system.engine.report_score(m.match_id, "b", 2, 13).await.unwrap();
    let result = system.engine.report_score(m.match_id, "a", 13, 2).await.unwrap();
    let outcome = match result {
        ReportOutcome::Completed(outcome) => outcome,
        other => panic!("expected completion, got {:?}", other),
    };

    let transfer = outcome.club_rep.expect("clubs should receive rep");
    assert_eq!(transfer.winner_club, "Alpha");
    assert_eq!(transfer.winner_club_delta, 100);
    assert_eq!(transfer.loser_club_delta, -10);
    assert_eq!(system.clubs.club_rep("Alpha").unwrap(), Some(100));
    assert_eq!(system.clubs.club_rep("Beta").unwrap(), Some(0));
}

#[tokio::test]
async fn test_crossing_tier_threshold_sends_rank_up() {
    let system = create_test_system(vec![profile("a", 1950, "NA"), profile("b", 1950, "NA")]);
    let m = system.pair("a", "b").await;
    system.drive_to_active(m.match_id).await;

    system.engine.report_score(m.match_id, "a", 15, 0).await.unwrap();
    system.engine.report_score(m.match_id, "b", 0, 15).await.unwrap();

    let a = system.engine.get_profile("a").await.unwrap().unwrap();
    assert_eq!(a.rep, 2055);
    assert_eq!(a.rank_tier(), RankTier::Gold);

    let rank_up = system.publisher.notifications_for("a");
    assert!(rank_up.iter().any(|n| n.kind == NotificationKind::RankUp));
    assert_eq!(system.publisher.count_of(NotificationKind::RankDown), 0);
}

#[tokio::test]
async fn test_reminder_sent_once_to_silent_opponent() {
    let system = create_test_system(vec![profile("a", 1000, "NA"), profile("b", 1000, "NA")]);
    let m = system.pair("a", "b").await;
    system.drive_to_active(m.match_id).await;

    system.engine.report_score(m.match_id, "a", 10, 4).await.unwrap();
    assert_eq!(system.engine.run_reminder_sweep().await.unwrap(), 0);

    system.clock.advance(Duration::minutes(11));
    assert_eq!(system.engine.run_reminder_sweep().await.unwrap(), 1);
    assert_eq!(system.engine.run_reminder_sweep().await.unwrap(), 0);

    let reminders: Vec<_> = system
        .publisher
        .notifications_for("b")
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Reminder)
        .collect();
    assert_eq!(reminders.len(), 1);
}

#[tokio::test]
async fn test_illegal_transition_is_rejected() {
    let system = create_test_system(vec![profile("a", 1000, "NA"), profile("b", 1000, "NA")]);
    let m = system.pair("a", "b").await;

    let err = assert_err!(
        system
            .engine
            .transition_to(m.match_id, Phase::Pregame, Phase::Active, "skip ahead")
            .await
    );
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    let moved = system
        .engine
        .transition_to(m.match_id, Phase::Pregame, Phase::StageSelect, "ready")
        .await
        .unwrap();
    assert_eq!(moved.phase, Phase::StageSelect);
}

#[tokio::test]
async fn test_manual_transition_cannot_resolve_match() {
    let system = create_test_system(vec![profile("a", 1000, "NA"), profile("b", 1000, "NA")]);
    let m = system.pair("a", "b").await;
    system.drive_to_active(m.match_id).await;

    for next in [Phase::Completed, Phase::Disputed] {
        let err = assert_err!(
            system
                .engine
                .transition_to(m.match_id, Phase::Active, next, "manual")
                .await
        );
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    let stored = system.engine.get_match(m.match_id).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Active);
    assert!(stored.outcome.is_none());
    let a = system.engine.get_profile("a").await.unwrap().unwrap();
    assert_eq!((a.rep, a.wins), (1000, 0));
    assert!(system.store.list_disputes().await.unwrap().is_empty());

    // Score reports still resolve it
    system.engine.report_score(m.match_id, "a", 13, 2).await.unwrap();
    let result = system.engine.report_score(m.match_id, "b", 2, 13).await.unwrap();
    assert!(matches!(result, ReportOutcome::Completed(_)));
}

#[tokio::test]
async fn test_rejected_command_notifies_issuer() {
    let system = create_test_system(vec![
        profile("a", 1000, "NA"),
        profile("b", 1000, "NA"),
        profile("intruder", 1000, "NA"),
    ]);
    let m = system.pair("a", "b").await;
    system.expire_phase(m.match_id).await;

    let result = system
        .engine
        .execute(EngineCommand::SubmitStageBan {
            match_id: m.match_id,
            player_id: "intruder".to_string(),
            stage: "Sky Ruins".to_string(),
        })
        .await;
    assert_err!(result);

    let rejected = system.publisher.notifications_for("intruder");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].kind, NotificationKind::CommandRejected);
    assert_eq!(rejected[0].payload["command"], "submit_stage_ban");
    assert_eq!(rejected[0].payload["code"], "validation");

    // Out-of-turn ban from a participant
    let result = system
        .engine
        .execute(EngineCommand::SubmitStageBan {
            match_id: m.match_id,
            player_id: "b".to_string(),
            stage: "Sky Ruins".to_string(),
        })
        .await;
    assert!(matches!(result, Err(EngineError::NotYourTurn { .. })));
}

#[tokio::test]
async fn test_stale_queue_entries_expire() {
    let system = create_test_system(vec![profile("a", 1000, "NA")]);
    assert_ok!(system.engine.join_queue("a", "NA").await);

    system.clock.advance(Duration::seconds(601));
    let report = system.engine.run_queue_sweep().await.unwrap();

    assert_eq!(report.removed(), 1);
    assert!(system.store.get_queue_entry("a").await.unwrap().is_none());
    assert_eq!(system.publisher.count_of(NotificationKind::QueueExpired), 1);
}
