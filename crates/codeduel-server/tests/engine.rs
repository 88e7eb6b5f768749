mod common;

use std::sync::Arc;
use std::time::Duration;

use codeduel_core::clan::creates_battle;
use codeduel_core::{BattleKind, BattleStatus, ProblemKey, QueueStatus, Verdict};
use codeduel_server::battle;
use codeduel_server::clan_matchmaking::{self, ClanPairing};
use codeduel_server::config::Config;
use codeduel_server::db::{self, BattleRow, ClanQueueRow, now_millis};
use codeduel_server::error::{ArenaError, TimeoutKind};
use codeduel_server::matchmaking::{self, MatchCheck};
use codeduel_server::state::AppState;
use codeduel_server::verdict;

use common::{FakeJudge, corpus, now_secs, problem, state_with, test_state};

async fn two_players(state: &AppState) -> (i64, i64) {
    let a = db::upsert_player(&state.db, "alice").await.unwrap();
    let b = db::upsert_player(&state.db, "bob").await.unwrap();
    (a, b)
}

async fn matched_battle(state: &AppState) -> (i64, i64, BattleRow) {
    let (a, b) = two_players(state).await;
    matchmaking::join_queue(state, a).await.unwrap();
    matchmaking::join_queue(state, b).await.unwrap();
    let battle = matchmaking::create_battle(state, a, b).await.unwrap();
    (a, b, battle)
}

// ── Global queue ────────────────────────────────────────────────────────

#[tokio::test]
async fn joining_twice_leaves_one_searching_row() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, _) = two_players(&state).await;

    matchmaking::join_queue(&state, a).await.unwrap();
    matchmaking::join_queue(&state, a).await.unwrap();

    let rows = db::searching_entries(&state.db, -1).await.unwrap();
    assert_eq!(rows.iter().filter(|r| r.player_id == a).count(), 1);
    assert_eq!(rows[0].status, QueueStatus::Searching);
    assert_eq!(rows[0].rating, 1200);
}

#[tokio::test]
async fn leaving_is_idempotent() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, _) = two_players(&state).await;

    matchmaking::join_queue(&state, a).await.unwrap();
    assert!(matchmaking::leave_queue(&state, a).await.unwrap());
    assert!(!matchmaking::leave_queue(&state, a).await.unwrap());
    assert!(db::get_queue_entry(&state.db, a).await.unwrap().is_none());
}

#[tokio::test]
async fn equal_ratings_get_an_unsolved_problem_in_band() {
    let judge = Arc::new(FakeJudge::new(corpus()));
    judge.submit("alice", ProblemKey::new(1500, "A"), 100, Some("OK"));
    judge.submit("bob", ProblemKey::new(1500, "C"), 100, Some("OK"));
    let state = test_state(judge).await;
    let (a, b) = two_players(&state).await;

    matchmaking::join_queue(&state, a).await.unwrap();
    matchmaking::join_queue(&state, b).await.unwrap();

    let MatchCheck::Matched(battle) = matchmaking::check_match(&state, a).await.unwrap() else {
        panic!("expected a match");
    };
    assert_eq!(battle.kind, BattleKind::Global);
    assert_eq!(battle.status, BattleStatus::Active);
    assert!(battle.start_time.is_some());

    let problem = battle.problem.unwrap();
    assert_eq!(problem.key, ProblemKey::new(1500, "B"));
    let rating = problem.rating.unwrap();
    assert!((1000..=1400).contains(&rating));

    for player in [a, b] {
        let entry = db::get_queue_entry(&state.db, player).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Matched);
        assert_eq!(entry.battle_id.as_deref(), Some(battle.id.as_str()));
    }
    let a_entry = db::get_queue_entry(&state.db, a).await.unwrap().unwrap();
    assert_eq!(a_entry.matched_with_id, Some(b));
}

#[tokio::test]
async fn concurrent_creation_yields_one_battle() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, b) = two_players(&state).await;
    matchmaking::join_queue(&state, a).await.unwrap();
    matchmaking::join_queue(&state, b).await.unwrap();

    let (first, second) = tokio::join!(
        matchmaking::create_battle(&state, a, b),
        matchmaking::create_battle(&state, b, a),
    );

    let results = [first, second];
    let created: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(created.len(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(ArenaError::RaceLost)))
    );

    let open = db::open_battle_for_pair(&state.db, a, b).await.unwrap().unwrap();
    assert_eq!(open.id, created[0].id);
}

#[tokio::test]
async fn players_too_far_apart_are_not_matched() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, b) = two_players(&state).await;
    db::set_rating(&state.db, b, 1350, true).await.unwrap();

    matchmaking::join_queue(&state, a).await.unwrap();
    matchmaking::join_queue(&state, b).await.unwrap();

    assert!(matches!(
        matchmaking::check_match(&state, a).await.unwrap(),
        MatchCheck::Searching
    ));
}

#[tokio::test]
async fn both_searchers_observe_the_same_battle() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, b) = two_players(&state).await;
    matchmaking::join_queue(&state, a).await.unwrap();
    matchmaking::join_queue(&state, b).await.unwrap();

    let (battle_a, battle_b) = tokio::join!(
        matchmaking::await_match(&state, a),
        matchmaking::await_match(&state, b),
    );
    assert_eq!(battle_a.unwrap().id, battle_b.unwrap().id);

    // Each side removed its own row once it saw the match.
    assert!(db::get_queue_entry(&state.db, a).await.unwrap().is_none());
    assert!(db::get_queue_entry(&state.db, b).await.unwrap().is_none());
}

#[tokio::test]
async fn lonely_search_times_out_and_leaves_the_queue() {
    let mut config = Config::for_tests();
    config.timings.matchmaking_timeout = Duration::from_millis(150);
    let state = state_with(config, Arc::new(FakeJudge::new(corpus()))).await;
    let (a, _) = two_players(&state).await;

    matchmaking::join_queue(&state, a).await.unwrap();
    let err = matchmaking::await_match(&state, a).await.unwrap_err();

    assert!(matches!(err, ArenaError::Timeout(TimeoutKind::Matchmaking)));
    assert!(db::get_queue_entry(&state.db, a).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_selection_releases_the_claim() {
    let state = test_state(Arc::new(FakeJudge::new(vec![problem(1600, "F", 2400)]))).await;
    let (a, b) = two_players(&state).await;
    matchmaking::join_queue(&state, a).await.unwrap();
    matchmaking::join_queue(&state, b).await.unwrap();

    let err = matchmaking::create_battle(&state, a, b).await.unwrap_err();
    assert!(matches!(err, ArenaError::NoProblemsInRange { low: 1000, high: 1400 }));

    for player in [a, b] {
        let entry = db::get_queue_entry(&state.db, player).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Searching);
    }
    assert!(db::open_battle_for_pair(&state.db, a, b).await.unwrap().is_none());
}

#[tokio::test]
async fn selection_failure_ends_both_searches() {
    let state = test_state(Arc::new(FakeJudge::new(vec![problem(1600, "F", 2400)]))).await;
    let (a, b) = two_players(&state).await;
    matchmaking::join_queue(&state, a).await.unwrap();
    matchmaking::join_queue(&state, b).await.unwrap();

    let started = std::time::Instant::now();
    let (ra, rb) = tokio::join!(
        matchmaking::await_match(&state, a),
        matchmaking::await_match(&state, b),
    );
    assert!(started.elapsed() < state.config.timings.matchmaking_timeout);

    for result in [ra, rb] {
        let err = result.unwrap_err();
        assert!(
            matches!(
                err,
                ArenaError::NoProblemsInRange { low: 1000, high: 1400 } | ArenaError::MatchAborted(_)
            ),
            "unexpected error: {err:?}"
        );
    }
    for player in [a, b] {
        assert!(db::get_queue_entry(&state.db, player).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn cancelled_claim_goes_back_to_searching() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, b) = two_players(&state).await;
    matchmaking::join_queue(&state, a).await.unwrap();
    matchmaking::join_queue(&state, b).await.unwrap();
    assert_eq!(db::claim_pair(&state.db, a, b).await.unwrap(), 2);

    // Only the claimant's claims are released.
    assert_eq!(matchmaking::release_stale_claims(&state, b).await.unwrap(), 0);
    assert_eq!(matchmaking::release_stale_claims(&state, a).await.unwrap(), 2);

    for player in [a, b] {
        let entry = db::get_queue_entry(&state.db, player).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Searching);
    }
    let battle = matchmaking::create_battle(&state, b, a).await.unwrap();
    assert_eq!(battle.status, BattleStatus::Active);
}

// ── Battle lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn participant_failure_rolls_the_battle_back() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, _) = two_players(&state).await;

    // Same player in both seats: the second participant row collides.
    let row = BattleRow {
        id: "half-built".into(),
        kind: BattleKind::Local,
        player1_id: a,
        player2_id: a,
        status: BattleStatus::RequestSent,
        problem: None,
        start_time: None,
        duration_seconds: 60,
        winner_id: None,
        created_at: now_millis(),
    };
    let err = battle::insert_with_participants(&state.db, &row).await.unwrap_err();

    assert!(matches!(err, ArenaError::PartialWriteFailure(_)));
    assert!(db::get_battle(&state.db, "half-built").await.unwrap().is_none());
    assert!(db::participants(&state.db, "half-built").await.unwrap().is_empty());
}

#[tokio::test]
async fn accepted_verdict_wins_and_moves_ratings() {
    let judge = Arc::new(FakeJudge::new(corpus()));
    let state = test_state(judge.clone()).await;
    let (a, b, battle) = matched_battle(&state).await;
    let key = battle.problem.clone().unwrap().key;

    let submitted_at = now_secs() - 5;
    judge.submit("alice", key.clone(), submitted_at - 100, Some("WRONG_ANSWER"));
    judge.submit("alice", key, submitted_at + 1, Some("OK"));

    let outcome = verdict::check_battle_verdict(&state, &battle.id, a, submitted_at)
        .await
        .unwrap();
    assert_eq!(outcome.verdict, Verdict::Accepted);
    assert!((outcome.xp - 0.5).abs() < 1e-9);

    let completion = outcome.completion.unwrap();
    assert_eq!(completion.winner_id, Some(a));
    assert_eq!(completion.battle.status, BattleStatus::Completed);
    let changes = completion.changes.unwrap();
    assert_eq!(changes.winner.rating_change(), 16);
    assert_eq!(changes.loser.rating_change(), -16);

    let alice = db::get_player(&state.db, a).await.unwrap().unwrap();
    let bob = db::get_player(&state.db, b).await.unwrap().unwrap();
    assert_eq!((alice.rating, alice.wins), (1216, 1));
    assert_eq!((bob.rating, bob.losses), (1184, 1));
    assert!((alice.xp - 0.8).abs() < 1e-9);
    assert!((bob.xp - 0.1).abs() < 1e-9);

    let parts = db::participants(&state.db, &battle.id).await.unwrap();
    let alice_part = parts.iter().find(|p| p.player_id == a).unwrap();
    assert!(alice_part.problem_solved);
    assert_eq!(alice_part.rating_change, Some(16));
}

#[tokio::test]
async fn completing_twice_applies_ratings_once() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, b, battle) = matched_battle(&state).await;

    assert!(battle::record_solve(&state, &battle.id, b).await.unwrap());
    assert!(!battle::record_solve(&state, &battle.id, b).await.unwrap());

    let first = battle::complete_battle(&state, &battle.id).await.unwrap();
    let second = battle::complete_battle(&state, &battle.id).await.unwrap();

    assert!(first.newly_completed);
    assert!(!second.newly_completed);
    assert_eq!(first.winner_id, Some(b));
    assert_eq!(second.winner_id, Some(b));

    let bob = db::get_player(&state.db, b).await.unwrap().unwrap();
    let alice = db::get_player(&state.db, a).await.unwrap().unwrap();
    assert_eq!(bob.rating, 1216);
    assert_eq!(alice.rating, 1184);
}

#[tokio::test]
async fn quitting_forfeits_and_clamps_xp() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, b, battle) = matched_battle(&state).await;

    let completion = battle::quit_battle(&state, &battle.id, a).await.unwrap();
    assert_eq!(completion.battle.status, BattleStatus::Abandoned);
    assert_eq!(completion.winner_id, Some(b));

    let alice = db::get_player(&state.db, a).await.unwrap().unwrap();
    let bob = db::get_player(&state.db, b).await.unwrap().unwrap();
    assert_eq!(alice.rating, 1184);
    assert_eq!(alice.xp, 0.0);
    assert_eq!(bob.rating, 1216);
    assert!((bob.xp - 0.3).abs() < 1e-9);

    // A finished battle never moves again.
    let again = battle::quit_battle(&state, &battle.id, b).await.unwrap_err();
    assert!(matches!(again, ArenaError::RaceLost));
    let done = battle::complete_battle(&state, &battle.id).await.unwrap();
    assert!(!done.newly_completed);
    assert_eq!(done.battle.status, BattleStatus::Abandoned);
}

#[tokio::test]
async fn challenge_flow() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, b) = two_players(&state).await;

    let sent = battle::create_challenge(&state, a, b).await.unwrap();
    assert_eq!(sent.status, BattleStatus::RequestSent);
    assert!(sent.problem.is_none());

    let dup = battle::create_challenge(&state, b, a).await.unwrap_err();
    assert!(matches!(dup, ArenaError::Validation(_)));
    let wrong = battle::accept_challenge(&state, &sent.id, a).await.unwrap_err();
    assert!(matches!(wrong, ArenaError::Validation(_)));

    let active = battle::accept_challenge(&state, &sent.id, b).await.unwrap();
    assert_eq!(active.status, BattleStatus::Active);
    assert!(active.start_time.is_some());
    assert!(active.problem.is_some());

    let late = battle::decline_challenge(&state, &sent.id, b).await.unwrap_err();
    assert!(matches!(late, ArenaError::RaceLost));
}

#[tokio::test]
async fn declined_challenge_frees_the_pair() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (a, b) = two_players(&state).await;

    let sent = battle::create_challenge(&state, a, b).await.unwrap();
    let declined = battle::decline_challenge(&state, &sent.id, b).await.unwrap();
    assert_eq!(declined.status, BattleStatus::Declined);

    battle::create_challenge(&state, b, a).await.unwrap();
}

#[tokio::test]
async fn expired_battles_are_closed_by_the_sweeper() {
    let mut config = Config::for_tests();
    config.timings.battle_duration_secs = 0;
    let state = state_with(config, Arc::new(FakeJudge::new(corpus()))).await;
    let (_, _, battle) = matched_battle(&state).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(battle::sweep_expired(&state).await.unwrap(), 1);

    let closed = battle::get_battle(&state.db, &battle.id).await.unwrap();
    assert_eq!(closed.status, BattleStatus::Completed);
    assert_eq!(closed.winner_id, None);
}

// ── Verdict polling ─────────────────────────────────────────────────────

#[tokio::test]
async fn polling_ignores_submissions_before_the_cutoff() {
    let judge = FakeJudge::new(corpus());
    let key = ProblemKey::new(1500, "B");
    judge.submit("carol", key.clone(), 100, Some("OK"));

    let err = verdict::poll_for_verdict(&judge, "carol", &key, 150, 3, Duration::from_millis(5))
        .await
        .unwrap_err();
    assert!(matches!(err, ArenaError::Timeout(TimeoutKind::Verdict)));

    judge.submit("carol", key.clone(), 200, Some("WRONG_ANSWER"));
    let verdict = verdict::poll_for_verdict(&judge, "carol", &key, 150, 3, Duration::from_millis(5))
        .await
        .unwrap();
    assert_eq!(verdict, Verdict::WrongAnswer);
}

#[tokio::test]
async fn polling_waits_out_pending_verdicts() {
    let judge = FakeJudge::new(corpus());
    let key = ProblemKey::new(1500, "B");
    judge.submit("dave", key.clone(), 200, Some("TESTING"));

    let err = verdict::poll_for_verdict(&judge, "dave", &key, 150, 3, Duration::from_millis(5))
        .await
        .unwrap_err();
    assert!(matches!(err, ArenaError::Timeout(TimeoutKind::Verdict)));
}

// ── Clans ───────────────────────────────────────────────────────────────

async fn clan_with_leader(state: &AppState, name: &str, handle: &str) -> (String, i64) {
    let player = db::upsert_player(&state.db, handle).await.unwrap();
    let clan = db::create_clan(&state.db, name, player).await.unwrap();
    clan_matchmaking::join_clan_queue(state, &clan, &[player])
        .await
        .unwrap();
    (clan, player)
}

/// Match two queued clans and return (creator side, waiting side).
async fn paired(state: &AppState, c1: &str, c2: &str) -> (ClanPairing, ClanPairing) {
    let p1 = clan_matchmaking::find_clan_match(state, c1).await.unwrap().unwrap();
    let p2 = clan_matchmaking::find_clan_match(state, c2).await.unwrap().unwrap();
    assert_eq!(p1.opponent.clan_id, c2);
    assert_eq!(p2.opponent.clan_id, c1);
    if creates_battle(c1, c2) { (p1, p2) } else { (p2, p1) }
}

#[tokio::test]
async fn clans_match_first_come_first_served() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (red, _) = clan_with_leader(&state, "red", "r1").await;
    let (blue, _) = clan_with_leader(&state, "blue", "b1").await;
    let (green, _) = clan_with_leader(&state, "green", "g1").await;

    let pairing = clan_matchmaking::find_clan_match(&state, &green)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pairing.opponent.clan_id, red);

    let again = clan_matchmaking::find_clan_match(&state, &green)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.opponent.clan_id, red);

    let blue_entry = db::get_clan_queue_entry(&state.db, &blue).await.unwrap().unwrap();
    assert_eq!(blue_entry.status, QueueStatus::Searching);
}

#[tokio::test]
async fn only_the_smaller_clan_id_creates() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (c1, _) = clan_with_leader(&state, "red", "r1").await;
    let (c2, _) = clan_with_leader(&state, "blue", "b1").await;
    let (creator, waiter) = paired(&state, &c1, &c2).await;

    let refused = clan_matchmaking::create_clan_battle(&state, &waiter)
        .await
        .unwrap_err();
    assert!(matches!(refused, ArenaError::Validation(_)));

    let battle = clan_matchmaking::create_clan_battle(&state, &creator).await.unwrap();
    assert_eq!(battle.status, BattleStatus::Preparing);
    assert_eq!(db::clan_problems(&state.db, &battle.id).await.unwrap().len(), 5);

    let found = clan_matchmaking::wait_for_clan_battle(
        &state,
        &waiter.own.clan_id,
        &creator.own.clan_id,
    )
    .await
    .unwrap();
    assert_eq!(found.id, battle.id);
    assert!(db::get_clan_queue_entry(&state.db, &c1).await.unwrap().is_none());
}

#[tokio::test]
async fn waiting_clan_gives_up_without_taking_over() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (c1, _) = clan_with_leader(&state, "red", "r1").await;
    let (c2, _) = clan_with_leader(&state, "blue", "b1").await;
    let (creator, waiter) = paired(&state, &c1, &c2).await;

    let err = clan_matchmaking::wait_for_clan_battle(
        &state,
        &waiter.own.clan_id,
        &creator.own.clan_id,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ArenaError::Timeout(TimeoutKind::ClanBattleWait)));
    assert!(
        db::open_clan_battle_for_pair(&state.db, &c1, &c2)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn clan_search_ends_in_one_shared_battle() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (c1, _) = clan_with_leader(&state, "red", "r1").await;
    let (c2, _) = clan_with_leader(&state, "blue", "b1").await;

    let (x, y) = tokio::join!(
        clan_matchmaking::await_clan_match(&state, &c1),
        clan_matchmaking::await_clan_match(&state, &c2),
    );
    assert_eq!(x.unwrap().id, y.unwrap().id);
}

#[tokio::test]
async fn starting_twice_keeps_the_start_time() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (c1, _) = clan_with_leader(&state, "red", "r1").await;
    let (c2, _) = clan_with_leader(&state, "blue", "b1").await;
    let (creator, _) = paired(&state, &c1, &c2).await;
    let created = clan_matchmaking::create_clan_battle(&state, &creator).await.unwrap();

    let first = battle::start_battle(&state, &created.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = battle::start_battle(&state, &created.id).await.unwrap();

    assert!(first.started);
    assert!(!second.started);
    assert_eq!(first.battle.status, BattleStatus::InProgress);
    assert!(first.battle.start_time.is_some());
    assert_eq!(first.battle.start_time, second.battle.start_time);
}

#[tokio::test]
async fn clan_with_more_solves_wins() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (c1, p1) = clan_with_leader(&state, "red", "r1").await;
    let (c2, p2) = clan_with_leader(&state, "blue", "b1").await;
    let (creator, _) = paired(&state, &c1, &c2).await;
    let created = clan_matchmaking::create_clan_battle(&state, &creator).await.unwrap();
    battle::start_battle(&state, &created.id).await.unwrap();

    assert!(battle::record_clan_solve(&state, &created.id, p1, 0).await.unwrap());
    assert!(!battle::record_clan_solve(&state, &created.id, p1, 0).await.unwrap());
    assert!(battle::record_clan_solve(&state, &created.id, p1, 1).await.unwrap());
    assert!(battle::record_clan_solve(&state, &created.id, p2, 0).await.unwrap());

    let done = battle::complete_clan_battle(&state, &created.id).await.unwrap();
    assert!(done.newly_completed);
    assert_eq!(done.winner_clan_id.as_deref(), Some(c1.as_str()));
    assert_eq!(done.battle.status, BattleStatus::Completed);

    let again = battle::complete_clan_battle(&state, &created.id).await.unwrap();
    assert!(!again.newly_completed);
    assert_eq!(again.winner_clan_id.as_deref(), Some(c1.as_str()));
}

#[tokio::test]
async fn clan_participant_failure_rolls_the_battle_back() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (c1, p1) = clan_with_leader(&state, "red", "r1").await;
    let (c2, _) = clan_with_leader(&state, "blue", "b1").await;

    let entry = |clan: &str, members: Vec<i64>| ClanQueueRow {
        clan_id: clan.to_string(),
        strength: 1200,
        selected_members: members,
        status: QueueStatus::Matched,
        matched_with_clan_id: None,
        battle_id: None,
        queue_time: 0,
    };
    // Player 9999 does not exist.
    let err = battle::create_clan_battle(&state, &entry(&c1, vec![p1]), &entry(&c2, vec![9999]))
        .await
        .unwrap_err();

    assert!(matches!(err, ArenaError::PartialWriteFailure(_)));
    assert!(
        db::open_clan_battle_for_pair(&state.db, &c1, &c2)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn clan_queue_rejects_outsiders() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (c1, _) = clan_with_leader(&state, "red", "r1").await;
    let outsider = db::upsert_player(&state.db, "loner").await.unwrap();

    let err = clan_matchmaking::join_clan_queue(&state, &c1, &[outsider])
        .await
        .unwrap_err();
    assert!(matches!(err, ArenaError::Validation(_)));
}

#[tokio::test]
async fn clan_queue_rejects_duplicate_members() {
    let state = test_state(Arc::new(FakeJudge::new(corpus()))).await;
    let (c1, leader) = clan_with_leader(&state, "red", "r1").await;

    let err = clan_matchmaking::join_clan_queue(&state, &c1, &[leader, leader])
        .await
        .unwrap_err();
    assert!(matches!(err, ArenaError::Validation(_)));

    let entry = db::get_clan_queue_entry(&state.db, &c1).await.unwrap().unwrap();
    assert_eq!(entry.selected_members, vec![leader]);
}
