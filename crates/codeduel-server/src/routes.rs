use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use codeduel_core::protocol::{
    BattleProblem, BattleView, ChallengeReply, ChallengeRequest, ClanBattleAction, ClanBattleView,
    ClanCreated, CreateClanRequest, JoinClanRequest, LeaderboardEntry, PlayerProfile,
    RegisterRequest, RunRequest, RunResponse, RushProblems, RushQuery,
};
use codeduel_core::verdict::classify_run;

use crate::battle;
use crate::db::{self, PlayerRow, now_millis};
use crate::error::{ArenaError, Result};
use crate::selector::select_problems;
use crate::state::AppState;
use crate::ws;

/// Most problems a single rush can draw.
const MAX_RUSH_PROBLEMS: usize = 20;

fn profile_of(p: PlayerRow) -> PlayerProfile {
    PlayerProfile {
        id: p.id,
        handle: p.handle,
        rating: p.rating,
        xp: p.xp,
        clan_id: p.clan_id,
        wins: p.wins as u32,
        losses: p.losses as u32,
    }
}

async fn player_by_handle(state: &AppState, handle: &str) -> Result<PlayerRow> {
    db::get_player_by_handle(&state.db, handle)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {handle}")))
}

// ── Health ──────────────────────────────────────────────────────────────

pub async fn health() -> &'static str {
    "ok"
}

// ── Players ─────────────────────────────────────────────────────────────

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<PlayerProfile>> {
    let handle = req.handle.trim();
    if handle.is_empty() {
        return Err(ArenaError::Validation("handle must not be empty".into()));
    }
    let id = db::upsert_player(&state.db, handle).await?;
    let player = db::get_player(&state.db, id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {id}")))?;
    tracing::info!(player_id = id, handle, "player registered");
    Ok(Json(profile_of(player)))
}

pub async fn profile(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Json<PlayerProfile>> {
    Ok(Json(profile_of(player_by_handle(&state, &handle).await?)))
}

pub async fn active_battle(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Json<Option<BattleView>>> {
    let player = player_by_handle(&state, &handle).await?;
    let found = battle::resolve_battle(&state.db, None, player.id).await?;
    Ok(Json(found.map(|b| battle::view(&b, now_millis()))))
}

// ── Leaderboard ─────────────────────────────────────────────────────────

pub async fn leaderboard(State(state): State<Arc<AppState>>) -> Result<Json<Vec<LeaderboardEntry>>> {
    let rows = db::get_leaderboard(&state.db, 100).await?;

    let entries = rows
        .into_iter()
        .enumerate()
        .map(|(i, r)| LeaderboardEntry {
            rank: i as u32 + 1,
            handle: r.handle,
            rating: r.rating,
            xp: r.xp,
            wins: r.wins as u32,
            losses: r.losses as u32,
        })
        .collect();

    Ok(Json(entries))
}

// ── Clans ───────────────────────────────────────────────────────────────

pub async fn create_clan(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateClanRequest>,
) -> Result<Json<ClanCreated>> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ArenaError::Validation("clan name must not be empty".into()));
    }
    if db::get_player(&state.db, req.leader_id).await?.is_none() {
        return Err(ArenaError::NotFound(format!("player {}", req.leader_id)));
    }
    let id = match db::create_clan(&state.db, name, req.leader_id).await {
        Ok(id) => id,
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(ArenaError::Validation(format!("clan name {name} is taken")));
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(clan_id = %id, name, leader = req.leader_id, "clan created");
    Ok(Json(ClanCreated {
        id,
        name: name.to_string(),
    }))
}

pub async fn join_clan(
    State(state): State<Arc<AppState>>,
    Path(clan_id): Path<String>,
    Json(req): Json<JoinClanRequest>,
) -> Result<StatusCode> {
    if !db::clan_exists(&state.db, &clan_id).await? {
        return Err(ArenaError::NotFound(format!("clan {clan_id}")));
    }
    if db::set_player_clan(&state.db, req.player_id, Some(&clan_id)).await? == 0 {
        return Err(ArenaError::NotFound(format!("player {}", req.player_id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── 1v1 battles ─────────────────────────────────────────────────────────

pub async fn get_battle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BattleView>> {
    let battle = battle::get_battle(&state.db, &id).await?;
    Ok(Json(battle::view(&battle, now_millis())))
}

pub async fn create_challenge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChallengeRequest>,
) -> Result<Json<BattleView>> {
    let battle = battle::create_challenge(&state, req.challenger_id, req.opponent_id).await?;
    Ok(Json(battle::view(&battle, now_millis())))
}

pub async fn accept_challenge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ChallengeReply>,
) -> Result<Json<BattleView>> {
    let battle = battle::accept_challenge(&state, &id, req.player_id).await?;
    Ok(Json(battle::view(&battle, now_millis())))
}

pub async fn decline_challenge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ChallengeReply>,
) -> Result<Json<BattleView>> {
    let battle = battle::decline_challenge(&state, &id, req.player_id).await?;
    Ok(Json(battle::view(&battle, now_millis())))
}

// ── Clan battles ────────────────────────────────────────────────────────

async fn clan_battle_view(state: &AppState, id: &str) -> Result<ClanBattleView> {
    let battle = battle::get_clan_battle(&state.db, id).await?;
    let problems = db::clan_problems(&state.db, id).await?;
    Ok(battle::clan_view(&battle, problems, now_millis()))
}

async fn require_clan_participant(state: &AppState, battle_id: &str, player_id: i64) -> Result<()> {
    match db::clan_participant_clan(&state.db, battle_id, player_id).await? {
        Some(_) => Ok(()),
        None => Err(ArenaError::Validation("not a participant of this clan battle".into())),
    }
}

pub async fn get_clan_battle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ClanBattleView>> {
    Ok(Json(clan_battle_view(&state, &id).await?))
}

pub async fn start_clan_battle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ClanBattleAction>,
) -> Result<Json<ClanBattleView>> {
    battle::get_clan_battle(&state.db, &id).await?;
    require_clan_participant(&state, &id, req.player_id).await?;
    battle::start_battle(&state, &id).await?;
    Ok(Json(clan_battle_view(&state, &id).await?))
}

pub async fn complete_clan_battle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ClanBattleAction>,
) -> Result<Json<ClanBattleView>> {
    battle::get_clan_battle(&state.db, &id).await?;
    require_clan_participant(&state, &id, req.player_id).await?;
    battle::complete_clan_battle(&state, &id).await?;
    Ok(Json(clan_battle_view(&state, &id).await?))
}

// ── Practice ────────────────────────────────────────────────────────────

pub async fn rush(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RushQuery>,
) -> Result<Json<RushProblems>> {
    if query.count == 0 || query.count > MAX_RUSH_PROBLEMS {
        return Err(ArenaError::Validation(format!(
            "count must be between 1 and {MAX_RUSH_PROBLEMS}"
        )));
    }
    let selection = select_problems(
        state.problems.as_ref(),
        &query.handle,
        &query.handle,
        query.rating,
        query.count,
    )
    .await?;
    Ok(Json(RushProblems {
        problems: selection.problems.iter().map(BattleProblem::from).collect(),
        fell_back: selection.fell_back,
    }))
}

pub async fn run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>> {
    let report = state.runner.run(&req.language, &req.source, &req.stdin).await?;
    let verdict = classify_run(&report, &req.expected_output);
    let stage = report.run.or(report.compile).unwrap_or_default();
    Ok(Json(RunResponse {
        verdict,
        stdout: stage.stdout,
        stderr: stage.stderr,
    }))
}

// ── WebSocket upgrade ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub player_id: i64,
}

pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let player = db::get_player(&state.db, query.player_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {}", query.player_id)))?;

    let current = state.connection_count.load(Ordering::Relaxed);
    if current >= state.config.max_connections {
        return Ok(StatusCode::SERVICE_UNAVAILABLE.into_response());
    }

    Ok(ws
        .on_upgrade(move |socket| ws::handle_socket(state, socket, player))
        .into_response())
}
