//! Battle lifecycle: creation, start, lookup, solves and completion.
//!
//! Creation is check-then-insert. When a later insert fails the battle row is
//! removed again by a compensating delete (`rollback_battle` /
//! `rollback_clan_battle`), so no half-built battle is ever observable for long.

use codeduel_core::battle::{SideScore, decide_winner, remaining_seconds};
use codeduel_core::clan::{ClanProblem, clan_problem_set};
use codeduel_core::protocol::{BattleProblem, BattleView, ClanBattleView};
use codeduel_core::{BattleKind, BattleStatus};
use sqlx::SqlitePool;

use crate::db::{self, BattleRow, ClanBattleRow, ClanQueueRow, PlayerRow, now_millis};
use crate::error::{ArenaError, Result};
use crate::notify::RowChange;
use crate::rating::{self, OutcomeChange};
use crate::selector::select_one;
use crate::state::AppState;

pub fn view(battle: &BattleRow, now: i64) -> BattleView {
    BattleView {
        id: battle.id.clone(),
        kind: battle.kind,
        status: battle.status,
        player1_id: battle.player1_id,
        player2_id: battle.player2_id,
        problem: battle.problem.clone(),
        start_time: battle.start_time,
        duration_seconds: battle.duration_seconds,
        remaining_seconds: remaining_seconds(battle.duration_seconds, battle.start_time, now),
        winner_id: battle.winner_id,
    }
}

fn publish_battle(state: &AppState, battle_id: &str, status: BattleStatus) {
    state.notifier.publish(RowChange::Battle {
        battle_id: battle_id.to_string(),
        status,
    });
}

fn publish_clan_battle(state: &AppState, battle: &ClanBattleRow, status: BattleStatus) {
    state.notifier.publish(RowChange::ClanBattle {
        battle_id: battle.id.clone(),
        clan_ids: (battle.clan1_id.clone(), battle.clan2_id.clone()),
        status,
    });
}

// ── 1v1 creation ────────────────────────────────────────────────────────

/// Delete a battle row and its participants.
pub async fn rollback_battle(pool: &SqlitePool, battle_id: &str) -> Result<()> {
    db::delete_battle(pool, battle_id).await?;
    tracing::warn!(battle_id, "battle rolled back");
    Ok(())
}

/// Insert a battle and one participant row per seat, undoing the battle if a
/// participant insert fails.
pub async fn insert_with_participants(pool: &SqlitePool, battle: &BattleRow) -> Result<()> {
    db::insert_battle(pool, battle).await?;

    for player_id in [battle.player1_id, battle.player2_id] {
        if let Err(e) = db::insert_participant(pool, &battle.id, player_id).await {
            rollback_battle(pool, &battle.id).await?;
            return Err(ArenaError::PartialWriteFailure(format!(
                "participant {player_id} of battle {}: {e}",
                battle.id
            )));
        }
    }
    Ok(())
}

fn new_battle(kind: BattleKind, status: BattleStatus, p1: i64, p2: i64, duration: i64) -> BattleRow {
    BattleRow {
        id: uuid::Uuid::new_v4().to_string(),
        kind,
        player1_id: p1,
        player2_id: p2,
        status,
        problem: None,
        start_time: None,
        duration_seconds: duration,
        winner_id: None,
        created_at: now_millis(),
    }
}

fn target_rating(a: &PlayerRow, b: &PlayerRow) -> i32 {
    (a.rating + b.rating) / 2
}

/// Create a ranked battle for two matched players, reusing an open one for the pair.
///
/// The problem is picked here, once, and persisted with the battle, so the
/// battle starts `active` with its clock running.
pub async fn create_global_battle(
    state: &AppState,
    a: &PlayerRow,
    b: &PlayerRow,
) -> Result<BattleRow> {
    if let Some(existing) = db::open_battle_for_pair(&state.db, a.id, b.id).await? {
        tracing::info!(battle_id = %existing.id, "reusing open battle for pair");
        return Ok(existing);
    }

    let picked = select_one(state.problems.as_ref(), &a.handle, &b.handle, target_rating(a, b)).await?;

    let mut battle = new_battle(
        BattleKind::Global,
        BattleStatus::Active,
        a.id,
        b.id,
        state.config.timings.battle_duration_secs,
    );
    battle.problem = Some(BattleProblem::from(&picked));
    battle.start_time = Some(battle.created_at);

    match insert_with_participants(&state.db, &battle).await {
        Ok(()) => {}
        Err(e) if e.is_unique_violation() => return Err(ArenaError::RaceLost),
        Err(e) => return Err(e),
    }

    tracing::info!(
        battle_id = %battle.id,
        player1 = a.id,
        player2 = b.id,
        problem = %battle.problem.as_ref().map(|p| p.key.to_string()).unwrap_or_default(),
        "global battle created"
    );
    publish_battle(state, &battle.id, battle.status);
    Ok(battle)
}

/// Send a friend challenge. The problem is picked when it is accepted.
pub async fn create_challenge(
    state: &AppState,
    challenger_id: i64,
    opponent_id: i64,
) -> Result<BattleRow> {
    if challenger_id == opponent_id {
        return Err(ArenaError::Validation("cannot challenge yourself".into()));
    }
    for id in [challenger_id, opponent_id] {
        if db::get_player(&state.db, id).await?.is_none() {
            return Err(ArenaError::NotFound(format!("player {id}")));
        }
    }
    if let Some(existing) = db::open_battle_for_pair(&state.db, challenger_id, opponent_id).await? {
        return Err(ArenaError::Validation(format!(
            "battle {} is already {} for these players",
            existing.id, existing.status
        )));
    }

    let battle = new_battle(
        BattleKind::Local,
        BattleStatus::RequestSent,
        challenger_id,
        opponent_id,
        state.config.timings.battle_duration_secs,
    );
    match insert_with_participants(&state.db, &battle).await {
        Ok(()) => {}
        Err(e) if e.is_unique_violation() => return Err(ArenaError::RaceLost),
        Err(e) => return Err(e),
    }

    publish_battle(state, &battle.id, battle.status);
    Ok(battle)
}

/// The challenged player accepts: pick the problem and start the clock.
pub async fn accept_challenge(state: &AppState, battle_id: &str, player_id: i64) -> Result<BattleRow> {
    let battle = get_battle(&state.db, battle_id).await?;
    if battle.player2_id != player_id {
        return Err(ArenaError::Validation("only the challenged player can accept".into()));
    }
    if battle.status != BattleStatus::RequestSent {
        return Err(ArenaError::RaceLost);
    }

    let p1 = player(&state.db, battle.player1_id).await?;
    let p2 = player(&state.db, battle.player2_id).await?;
    let picked =
        select_one(state.problems.as_ref(), &p1.handle, &p2.handle, target_rating(&p1, &p2)).await?;
    let problem = BattleProblem::from(&picked);

    if db::activate_challenge(&state.db, battle_id, &problem, now_millis()).await? == 0 {
        return Err(ArenaError::RaceLost);
    }
    publish_battle(state, battle_id, BattleStatus::Active);
    get_battle(&state.db, battle_id).await
}

pub async fn decline_challenge(state: &AppState, battle_id: &str, player_id: i64) -> Result<BattleRow> {
    let battle = get_battle(&state.db, battle_id).await?;
    if battle.opponent_of(player_id).is_none() {
        return Err(ArenaError::Validation("not part of this challenge".into()));
    }
    let changed = db::transition_battle(
        &state.db,
        battle_id,
        &[BattleStatus::RequestSent],
        BattleStatus::Declined,
        None,
    )
    .await?;
    if changed == 0 {
        return Err(ArenaError::RaceLost);
    }
    publish_battle(state, battle_id, BattleStatus::Declined);
    get_battle(&state.db, battle_id).await
}

// ── 1v1 lookup ──────────────────────────────────────────────────────────

async fn player(pool: &SqlitePool, id: i64) -> Result<PlayerRow> {
    db::get_player(pool, id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {id}")))
}

pub async fn get_battle(pool: &SqlitePool, battle_id: &str) -> Result<BattleRow> {
    db::get_battle(pool, battle_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("battle {battle_id}")))
}

/// The battle to resume: by id if given, else the player's latest open battle.
pub async fn resolve_battle(
    pool: &SqlitePool,
    battle_id: Option<&str>,
    player_id: i64,
) -> Result<Option<BattleRow>> {
    match battle_id {
        Some(id) => Ok(Some(get_battle(pool, id).await?)),
        None => Ok(db::active_battle_for_player(pool, player_id).await?),
    }
}

// ── 1v1 progress and completion ─────────────────────────────────────────

/// Result of a terminal transition.
#[derive(Debug, Clone)]
pub struct Completion {
    pub battle: BattleRow,
    pub winner_id: Option<i64>,
    /// This call performed the transition (and applied ratings).
    pub newly_completed: bool,
    pub changes: Option<OutcomeChange>,
}

/// Mark `player_id` as having solved the battle problem. Returns false if already marked.
pub async fn record_solve(state: &AppState, battle_id: &str, player_id: i64) -> Result<bool> {
    let battle = get_battle(&state.db, battle_id).await?;
    if battle.opponent_of(player_id).is_none() {
        return Err(ArenaError::Validation("not a participant of this battle".into()));
    }
    if !battle.status.is_running() {
        return Ok(false);
    }
    let start = battle.start_time.unwrap_or(battle.created_at);
    let taken = ((now_millis() - start) / 1000).max(0);
    Ok(db::mark_solved(&state.db, battle_id, player_id, taken).await? == 1)
}

async fn persisted_winner(pool: &SqlitePool, battle: &BattleRow) -> Result<Option<i64>> {
    let parts = db::participants(pool, &battle.id).await?;
    let score = |player_id: i64| {
        let p = parts.iter().find(|p| p.player_id == player_id);
        SideScore {
            id: player_id,
            solved: p.map(|p| p.problem_solved as i64).unwrap_or(0),
            time_taken: p.and_then(|p| p.time_taken),
        }
    };
    Ok(decide_winner(&score(battle.player1_id), &score(battle.player2_id)))
}

/// Decide the winner from persisted participant stats and close the battle.
///
/// Only the call whose transition lands applies ratings. Later calls return the
/// same winner, recomputed from the same persisted stats. A rating failure is
/// returned to the caller but does not reopen the battle.
pub async fn complete_battle(state: &AppState, battle_id: &str) -> Result<Completion> {
    let battle = get_battle(&state.db, battle_id).await?;
    let winner_id = persisted_winner(&state.db, &battle).await?;

    let changed = db::transition_battle(
        &state.db,
        battle_id,
        &[BattleStatus::Active, BattleStatus::InProgress],
        BattleStatus::Completed,
        winner_id,
    )
    .await?;

    if changed == 0 {
        let battle = get_battle(&state.db, battle_id).await?;
        let winner_id = match battle.status {
            BattleStatus::Completed => winner_id,
            _ => battle.winner_id,
        };
        return Ok(Completion {
            battle,
            winner_id,
            newly_completed: false,
            changes: None,
        });
    }

    publish_battle(state, battle_id, BattleStatus::Completed);
    tracing::info!(battle_id, ?winner_id, "battle completed");

    let mut changes = None;
    if let Some(winner) = winner_id {
        let loser = battle.opponent_of(winner).unwrap_or(winner);
        let change = rating::process_match_outcome(&state.db, winner, loser).await?;
        record_changes(&state.db, battle_id, &change).await?;
        changes = Some(change);
    }

    Ok(Completion {
        battle: get_battle(&state.db, battle_id).await?,
        winner_id,
        newly_completed: true,
        changes,
    })
}

/// `quitter_id` forfeits a running battle.
pub async fn quit_battle(state: &AppState, battle_id: &str, quitter_id: i64) -> Result<Completion> {
    let battle = get_battle(&state.db, battle_id).await?;
    let winner = battle
        .opponent_of(quitter_id)
        .ok_or_else(|| ArenaError::Validation("not a participant of this battle".into()))?;

    let changed = db::transition_battle(
        &state.db,
        battle_id,
        &[BattleStatus::Active, BattleStatus::InProgress],
        BattleStatus::Abandoned,
        Some(winner),
    )
    .await?;
    if changed == 0 {
        return Err(ArenaError::RaceLost);
    }
    publish_battle(state, battle_id, BattleStatus::Abandoned);
    tracing::info!(battle_id, quitter_id, "battle abandoned");

    let change = rating::process_quit(&state.db, quitter_id, winner).await?;
    record_changes(&state.db, battle_id, &change).await?;

    Ok(Completion {
        battle: get_battle(&state.db, battle_id).await?,
        winner_id: Some(winner),
        newly_completed: true,
        changes: Some(change),
    })
}

async fn record_changes(pool: &SqlitePool, battle_id: &str, change: &OutcomeChange) -> Result<()> {
    for p in [&change.winner, &change.loser] {
        db::record_outcome(pool, battle_id, p.player_id, p.rating_change(), p.xp_delta).await?;
    }
    Ok(())
}

// ── Clan battles ────────────────────────────────────────────────────────

pub fn clan_view(
    battle: &ClanBattleRow,
    problems: Vec<ClanProblem>,
    now: i64,
) -> ClanBattleView {
    ClanBattleView {
        id: battle.id.clone(),
        clan1_id: battle.clan1_id.clone(),
        clan2_id: battle.clan2_id.clone(),
        status: battle.status,
        start_time: battle.start_time,
        duration_seconds: battle.duration_seconds,
        remaining_seconds: remaining_seconds(battle.duration_seconds, battle.start_time, now),
        winner_clan_id: battle.winner_clan_id.clone(),
        problems,
    }
}

/// Delete a clan battle with its participants, problems and solves.
pub async fn rollback_clan_battle(pool: &SqlitePool, battle_id: &str) -> Result<()> {
    let mut conn = pool.acquire().await?;
    db::delete_clan_battle(&mut conn, battle_id).await?;
    tracing::warn!(battle_id, "clan battle rolled back");
    Ok(())
}

/// Create the battle between two matched clans on the fixed problem set.
pub async fn create_clan_battle(
    state: &AppState,
    own: &ClanQueueRow,
    opponent: &ClanQueueRow,
) -> Result<ClanBattleRow> {
    let pool = &state.db;
    if let Some(existing) =
        db::open_clan_battle_for_pair(pool, &own.clan_id, &opponent.clan_id).await?
    {
        return Ok(existing);
    }

    let battle = ClanBattleRow {
        id: uuid::Uuid::new_v4().to_string(),
        clan1_id: own.clan_id.clone(),
        clan2_id: opponent.clan_id.clone(),
        status: BattleStatus::Preparing,
        start_time: None,
        duration_seconds: state.config.timings.clan_battle_duration_secs,
        winner_clan_id: None,
        created_at: now_millis(),
    };
    match db::insert_clan_battle(pool, &battle).await {
        Ok(()) => {}
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => return Err(ArenaError::RaceLost),
        Err(e) => return Err(e.into()),
    }

    if let Err(e) = insert_clan_rows(pool, &battle, own, opponent).await {
        rollback_clan_battle(pool, &battle.id).await?;
        return Err(ArenaError::PartialWriteFailure(format!("clan battle {}: {e}", battle.id)));
    }

    tracing::info!(
        battle_id = %battle.id,
        clan1 = %battle.clan1_id,
        clan2 = %battle.clan2_id,
        "clan battle created"
    );
    publish_clan_battle(state, &battle, battle.status);
    Ok(battle)
}

async fn insert_clan_rows(
    pool: &SqlitePool,
    battle: &ClanBattleRow,
    own: &ClanQueueRow,
    opponent: &ClanQueueRow,
) -> Result<(), sqlx::Error> {
    for side in [own, opponent] {
        for member in &side.selected_members {
            db::insert_clan_participant(pool, &battle.id, *member, &side.clan_id).await?;
        }
    }
    let mut conn = pool.acquire().await?;
    db::insert_clan_problems(&mut conn, &battle.id, &clan_problem_set()).await
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub battle: ClanBattleRow,
    /// False when the battle was already running; `start_time` is untouched then.
    pub started: bool,
}

/// `preparing -> in_progress`. A repeated start never moves `start_time`.
pub async fn start_battle(state: &AppState, battle_id: &str) -> Result<StartOutcome> {
    let started = db::start_clan_battle(&state.db, battle_id, now_millis()).await? == 1;
    let battle = get_clan_battle(&state.db, battle_id).await?;
    if started {
        publish_clan_battle(state, &battle, BattleStatus::InProgress);
        tracing::info!(battle_id, "clan battle started");
    } else if battle.status != BattleStatus::InProgress {
        return Err(ArenaError::Validation(format!(
            "battle is {}, cannot start",
            battle.status
        )));
    }
    Ok(StartOutcome { battle, started })
}

pub async fn get_clan_battle(pool: &SqlitePool, battle_id: &str) -> Result<ClanBattleRow> {
    db::get_clan_battle(pool, battle_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("clan battle {battle_id}")))
}

/// Record a clan's first solve of the problem at `position`. Returns false if
/// the clan already had it. Completes the battle once a clan has solved them all.
pub async fn record_clan_solve(
    state: &AppState,
    battle_id: &str,
    player_id: i64,
    position: i64,
) -> Result<bool> {
    let pool = &state.db;
    let battle = get_clan_battle(pool, battle_id).await?;
    if battle.status != BattleStatus::InProgress {
        return Ok(false);
    }
    let clan_id = db::clan_participant_clan(pool, battle_id, player_id)
        .await?
        .ok_or_else(|| ArenaError::Validation("not a participant of this clan battle".into()))?;
    let problems = db::clan_problems(pool, battle_id).await?;
    if !problems.iter().any(|p| p.position == position) {
        return Err(ArenaError::NotFound(format!("problem {position} in battle {battle_id}")));
    }

    if db::insert_clan_solve(pool, battle_id, &clan_id, position, player_id).await? == 0 {
        return Ok(false);
    }
    let start = battle.start_time.unwrap_or(battle.created_at);
    db::bump_clan_participant(pool, battle_id, player_id, ((now_millis() - start) / 1000).max(0))
        .await?;

    let scores = db::clan_scores(pool, battle_id).await?;
    if scores
        .iter()
        .any(|(c, solved, _)| *c == clan_id && *solved as usize >= problems.len())
    {
        complete_clan_battle(state, battle_id).await?;
    }
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct ClanCompletion {
    pub battle: ClanBattleRow,
    pub winner_clan_id: Option<String>,
    pub newly_completed: bool,
}

/// Most problems solved wins, then least total time. Idempotent.
pub async fn complete_clan_battle(state: &AppState, battle_id: &str) -> Result<ClanCompletion> {
    let pool = &state.db;
    let battle = get_clan_battle(pool, battle_id).await?;
    let scores = db::clan_scores(pool, battle_id).await?;

    let side = |clan_id: &str| {
        let (solved, time) = scores
            .iter()
            .find(|(c, _, _)| c == clan_id)
            .map(|(_, s, t)| (*s, *t))
            .unwrap_or((0, 0));
        SideScore {
            id: clan_id.to_string(),
            solved,
            time_taken: (solved > 0).then_some(time),
        }
    };
    let winner = decide_winner(&side(&battle.clan1_id), &side(&battle.clan2_id));

    let changed =
        db::finish_clan_battle(pool, battle_id, BattleStatus::Completed, winner.as_deref()).await?;
    let battle = get_clan_battle(pool, battle_id).await?;
    if changed == 1 {
        publish_clan_battle(state, &battle, BattleStatus::Completed);
        tracing::info!(battle_id, winner = ?winner, "clan battle completed");
    }
    Ok(ClanCompletion {
        battle,
        winner_clan_id: winner,
        newly_completed: changed == 1,
    })
}

// ── Expiry ──────────────────────────────────────────────────────────────

/// Close every battle whose clock has run out. Returns how many were closed.
pub async fn sweep_expired(state: &AppState) -> Result<usize> {
    let now = now_millis();
    let mut closed = 0;

    for id in db::expired_battles(&state.db, now).await? {
        match complete_battle(state, &id).await {
            Ok(c) if c.newly_completed => closed += 1,
            Ok(_) => {}
            Err(e) => tracing::warn!(battle_id = %id, error = %e, "could not close expired battle"),
        }
    }
    for id in db::expired_clan_battles(&state.db, now).await? {
        match complete_clan_battle(state, &id).await {
            Ok(c) if c.newly_completed => closed += 1,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(battle_id = %id, error = %e, "could not close expired clan battle")
            }
        }
    }
    Ok(closed)
}
