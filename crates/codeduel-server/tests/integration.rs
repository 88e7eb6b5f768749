mod common;

use std::sync::Arc;
use std::time::Duration;

use codeduel_core::protocol::{BattleView, LeaderboardEntry, PlayerProfile, RunResponse, RushProblems};
use codeduel_core::{BattleStatus, Problem, Verdict};
use codeduel_server::config::Config;
use common::{EchoRunner, FakeJudge, corpus, now_secs, problem};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

/// Spin up a test server on a random port, return the base URL and its judge.
async fn start_server() -> (String, Arc<FakeJudge>) {
    start_server_with(corpus()).await
}

async fn start_server_with(problems: Vec<Problem>) -> (String, Arc<FakeJudge>) {
    let judge = Arc::new(FakeJudge::new(problems));
    let (app, _state) =
        codeduel_server::build_app_with(Config::for_tests(), judge.clone(), Arc::new(EchoRunner))
            .await
            .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{}", port), judge)
}

async fn register(base: &str, handle: &str) -> PlayerProfile {
    reqwest::Client::new()
        .post(format!("{}/players", base))
        .json(&json!({ "handle": handle }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn ws_connect(base: &str, player_id: i64) -> (WsSink, WsSource) {
    let ws_url = base.replace("http://", "ws://");
    let url = format!("{}/ws?player_id={}", ws_url, player_id);
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    stream.split()
}

async fn ws_send(sink: &mut WsSink, msg: serde_json::Value) {
    sink.send(Message::Text(msg.to_string().into())).await.unwrap();
}

/// Receive messages until we get one matching the expected type.
async fn ws_recv_type(stream: &mut WsSource, msg_type: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("Timed out waiting for message type: {}", msg_type);
        }
        let msg = tokio::time::timeout(remaining, stream.next())
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for {}", msg_type))
            .unwrap()
            .unwrap();

        if let Message::Text(text) = msg {
            let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            if parsed["type"].as_str() == Some(msg_type) {
                return parsed;
            }
        }
    }
}

/// Register two players, queue both over WebSocket and return the shared battle.
async fn matched_pair(
    base: &str,
) -> (
    (PlayerProfile, WsSink, WsSource),
    (PlayerProfile, WsSink, WsSource),
    BattleView,
) {
    let alice = register(base, "alice").await;
    let bob = register(base, "bob").await;

    let (mut a_tx, mut a_rx) = ws_connect(base, alice.id).await;
    let (mut b_tx, mut b_rx) = ws_connect(base, bob.id).await;
    ws_recv_type(&mut a_rx, "Hello").await;
    ws_recv_type(&mut b_rx, "Hello").await;

    ws_send(&mut a_tx, json!({ "type": "JoinQueue" })).await;
    ws_send(&mut b_tx, json!({ "type": "JoinQueue" })).await;

    let a_found = ws_recv_type(&mut a_rx, "MatchFound").await;
    let b_found = ws_recv_type(&mut b_rx, "MatchFound").await;
    assert_eq!(a_found["battle"]["id"], b_found["battle"]["id"]);

    let battle: BattleView = serde_json::from_value(a_found["battle"].clone()).unwrap();
    ((alice, a_tx, a_rx), (bob, b_tx, b_rx), battle)
}

#[tokio::test]
async fn test_health() {
    let (base, _) = start_server().await;
    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_register_is_idempotent_and_profile_resolves() {
    let (base, _) = start_server().await;

    let first = register(&base, "tourist").await;
    let again = register(&base, "tourist").await;
    assert_eq!(first.id, again.id);
    assert_eq!(first.rating, 1200);

    let profile: PlayerProfile = reqwest::get(format!("{}/players/tourist", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(profile.id, first.id);
    assert_eq!(profile.wins, 0);

    let missing = reqwest::get(format!("{}/players/nobody", base)).await.unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn test_ws_rejects_unknown_player() {
    let (base, _) = start_server().await;
    let url = format!("{}/ws?player_id=424242", base.replace("http://", "ws://"));
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}

#[tokio::test]
async fn test_queue_pairs_two_players() {
    let (base, _) = start_server().await;
    let ((alice, _, _), (bob, _, _), battle) = matched_pair(&base).await;

    assert_eq!(battle.status, BattleStatus::Active);
    let mut ids = [battle.player1_id, battle.player2_id];
    ids.sort();
    let mut expected = [alice.id, bob.id];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(battle.problem.is_some());

    let active: Option<BattleView> = reqwest::get(format!("{}/players/alice/battle", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active.unwrap().id, battle.id);
}

#[tokio::test]
async fn test_unplayable_band_fails_the_match_for_both() {
    let (base, _) = start_server_with(vec![problem(1600, "F", 2400)]).await;
    let alice = register(&base, "alice").await;
    let bob = register(&base, "bob").await;

    let (mut a_tx, mut a_rx) = ws_connect(&base, alice.id).await;
    let (mut b_tx, mut b_rx) = ws_connect(&base, bob.id).await;
    ws_recv_type(&mut a_rx, "Hello").await;
    ws_recv_type(&mut b_rx, "Hello").await;

    ws_send(&mut a_tx, json!({ "type": "JoinQueue" })).await;
    ws_send(&mut b_tx, json!({ "type": "JoinQueue" })).await;

    // Well before the matchmaking timeout would report NoOpponentFound.
    for rx in [&mut a_rx, &mut b_rx] {
        let failed = ws_recv_type(rx, "MatchFailed").await;
        assert!(!failed["reason"].as_str().unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_quit_forfeits_and_updates_leaderboard() {
    let (base, _) = start_server().await;
    let ((_, mut a_tx, mut a_rx), (bob, _, mut b_rx), battle) = matched_pair(&base).await;

    ws_send(&mut a_tx, json!({ "type": "Quit", "battle_id": battle.id })).await;

    let a_end = ws_recv_type(&mut a_rx, "BattleEnded").await;
    let b_end = ws_recv_type(&mut b_rx, "BattleEnded").await;
    assert_eq!(a_end["status"], "abandoned");
    assert_eq!(a_end["winner_id"], bob.id);
    assert_eq!(b_end["winner_id"], bob.id);
    assert!(a_end["rating_change"].as_i64().unwrap() < 0);
    assert!(b_end["rating_change"].as_i64().unwrap() > 0);

    let board: Vec<LeaderboardEntry> = reqwest::get(format!("{}/leaderboard", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].handle, "bob");
    assert_eq!(board[0].rank, 1);
    assert_eq!(board[0].wins, 1);
    assert_eq!(board[1].handle, "alice");
    assert_eq!(board[1].losses, 1);
    assert!(board[0].rating > board[1].rating);

    // A second quit finds nothing left to abandon.
    ws_send(&mut a_tx, json!({ "type": "Quit", "battle_id": battle.id })).await;
    ws_recv_type(&mut a_rx, "Error").await;
}

#[tokio::test]
async fn test_accepted_verdict_ends_the_battle() {
    let (base, judge) = start_server().await;
    let ((alice, mut a_tx, mut a_rx), (_, _, mut b_rx), battle) = matched_pair(&base).await;
    let key = battle.problem.clone().unwrap().key;

    let submitted_at = now_secs() - 5;
    judge.submit("alice", key, submitted_at + 1, Some("OK"));

    ws_send(
        &mut a_tx,
        json!({ "type": "CheckVerdict", "battle_id": battle.id, "submitted_at": submitted_at }),
    )
    .await;

    let verdict = ws_recv_type(&mut a_rx, "Verdict").await;
    assert_eq!(verdict["verdict"], "ACCEPTED");

    let b_end = ws_recv_type(&mut b_rx, "BattleEnded").await;
    assert_eq!(b_end["status"], "completed");
    assert_eq!(b_end["winner_id"], alice.id);
    assert_eq!(b_end["rating_change"], -16);
}

#[tokio::test]
async fn test_challenge_accept_and_decline() {
    let (base, _) = start_server().await;
    let client = reqwest::Client::new();
    let alice = register(&base, "alice").await;
    let bob = register(&base, "bob").await;

    let challenge: BattleView = client
        .post(format!("{}/challenges", base))
        .json(&json!({ "challenger_id": alice.id, "opponent_id": bob.id }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(challenge.status, BattleStatus::RequestSent);
    assert!(challenge.problem.is_none());

    // Only the challenged player may answer.
    let wrong = client
        .post(format!("{}/challenges/{}/accept", base, challenge.id))
        .json(&json!({ "player_id": alice.id }))
        .send()
        .await
        .unwrap();
    assert!(wrong.status().is_client_error());

    let accepted: BattleView = client
        .post(format!("{}/challenges/{}/accept", base, challenge.id))
        .json(&json!({ "player_id": bob.id }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(accepted.status, BattleStatus::Active);
    assert!(accepted.problem.is_some());

    let late_decline = client
        .post(format!("{}/challenges/{}/decline", base, challenge.id))
        .json(&json!({ "player_id": bob.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(late_decline.status(), 409);
}

#[tokio::test]
async fn test_practice_run_and_rush() {
    let (base, _) = start_server().await;
    let client = reqwest::Client::new();

    let run: RunResponse = client
        .post(format!("{}/practice/run", base))
        .json(&json!({
            "language": "python",
            "source": "print(input())",
            "stdin": "42\n",
            "expected_output": "42",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(run.verdict, Verdict::Accepted);
    assert_eq!(run.stdout, "42\n");

    let rush: RushProblems = client
        .get(format!("{}/practice/rush", base))
        .query(&[("handle", "alice"), ("rating", "1200"), ("count", "3")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rush.problems.len(), 3);
    assert!(!rush.fell_back);
    assert!(
        rush.problems
            .iter()
            .all(|p| p.rating.is_some_and(|r| (1000..=1400).contains(&r)))
    );

    let too_many = client
        .get(format!("{}/practice/rush", base))
        .query(&[("handle", "alice"), ("rating", "1200"), ("count", "50")])
        .send()
        .await
        .unwrap();
    assert_eq!(too_many.status(), 400);
}
