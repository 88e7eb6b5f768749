//! Global 1v1 matchmaking queue.
//!
//! Each searching player polls its own queue row. Whoever finds an opponent
//! first claims both rows (`searching -> creating`) in one conditional update
//! and creates the battle; the other side sees its row turn `matched`.

use codeduel_core::QueueStatus;
use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;

use crate::battle;
use crate::db::{self, BattleRow, QueueRow};
use crate::error::{ArenaError, Result, TimeoutKind};
use crate::notify::RowChange;
use crate::state::AppState;

/// Widest rating gap two players can be matched across.
pub const MAX_RATING_GAP: i32 = 100;

fn publish(state: &AppState, player_id: i64, status: Option<QueueStatus>, battle_id: Option<&str>) {
    state.notifier.publish(RowChange::Queue {
        player_id,
        status,
        battle_id: battle_id.map(str::to_string),
    });
}

/// Put a player in the queue, replacing any previous entry.
pub async fn join_queue(state: &AppState, player_id: i64) -> Result<QueueRow> {
    let player = db::get_player(&state.db, player_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {player_id}")))?;

    let mut tx = state.db.begin().await?;
    db::delete_queue_entry(&mut *tx, player_id).await?;
    db::insert_queue_entry(&mut *tx, player_id, player.rating).await?;
    let entry = db::get_queue_entry(&mut *tx, player_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("queue entry {player_id}")))?;
    tx.commit().await?;

    tracing::info!(player_id, rating = player.rating, "joined queue");
    publish(state, player_id, Some(QueueStatus::Searching), None);
    Ok(entry)
}

/// Remove a player from the queue. Leaving twice is fine.
pub async fn leave_queue(state: &AppState, player_id: i64) -> Result<bool> {
    let removed = db::delete_queue_entry(&state.db, player_id).await? > 0;
    if removed {
        tracing::info!(player_id, "left queue");
        publish(state, player_id, None, None);
    }
    Ok(removed)
}

/// Closest-rated candidate within `MAX_RATING_GAP`. Ties go to the first one listed.
pub fn find_best_match<'a>(rating: i32, candidates: &'a [QueueRow]) -> Option<&'a QueueRow> {
    candidates
        .iter()
        .map(|c| ((c.rating - rating).abs(), c))
        .filter(|(distance, _)| *distance <= MAX_RATING_GAP)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, c)| c)
}

/// Claim both queue rows and create their battle.
///
/// Fails with `RaceLost` if either row is no longer searching. If creation
/// fails after the claim, both rows go back to searching and, unless the
/// failure is transient, `b` is told the match was aborted.
pub async fn create_battle(state: &AppState, a: i64, b: i64) -> Result<BattleRow> {
    if a == b {
        return Err(ArenaError::Validation("cannot match a player with themselves".into()));
    }

    let mut tx = state.db.begin().await?;
    let claimed = db::claim_pair(&mut *tx, a, b).await?;
    if claimed != 2 {
        tx.rollback().await?;
        tracing::debug!(a, b, claimed, "claim lost");
        return Err(ArenaError::RaceLost);
    }
    tx.commit().await?;

    let battle = match create_for_pair(state, a, b).await {
        Ok(battle) => battle,
        Err(e) => {
            db::release_pair(&state.db, a, b).await?;
            if !e.is_transient() {
                state.notifier.publish(RowChange::MatchAborted {
                    player_id: b,
                    reason: e.to_string(),
                });
            }
            publish(state, a, Some(QueueStatus::Searching), None);
            publish(state, b, Some(QueueStatus::Searching), None);
            tracing::warn!(a, b, error = %e, "battle creation failed, released pair");
            return Err(e);
        }
    };

    let marked = db::mark_pair_matched(&state.db, a, b, &battle.id).await?;
    if marked != 2 {
        // One side left the queue mid-creation; the battle stands.
        tracing::warn!(a, b, battle_id = %battle.id, marked, "pair only partly marked matched");
    }
    publish(state, a, Some(QueueStatus::Matched), Some(&battle.id));
    publish(state, b, Some(QueueStatus::Matched), Some(&battle.id));
    Ok(battle)
}

async fn create_for_pair(state: &AppState, a: i64, b: i64) -> Result<BattleRow> {
    let pa = player(&state.db, a).await?;
    let pb = player(&state.db, b).await?;
    battle::create_global_battle(state, &pa, &pb).await
}

async fn player(pool: &SqlitePool, id: i64) -> Result<db::PlayerRow> {
    db::get_player(pool, id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {id}")))
}

#[derive(Debug, Clone)]
pub enum MatchCheck {
    Matched(BattleRow),
    Searching,
    /// The player's queue row is gone and no battle was found for them.
    Gone,
}

/// One idempotent look at the queue on behalf of `player_id`.
pub async fn check_match(state: &AppState, player_id: i64) -> Result<MatchCheck> {
    let Some(entry) = db::get_queue_entry(&state.db, player_id).await? else {
        return Ok(match db::active_battle_for_player(&state.db, player_id).await? {
            Some(battle) => MatchCheck::Matched(battle),
            None => MatchCheck::Gone,
        });
    };

    match entry.status {
        QueueStatus::Matched => match entry.battle_id {
            Some(id) => Ok(MatchCheck::Matched(battle::get_battle(&state.db, &id).await?)),
            None => Ok(MatchCheck::Searching),
        },
        QueueStatus::Creating => Ok(MatchCheck::Searching),
        QueueStatus::Searching => {
            let candidates = db::searching_entries(&state.db, player_id).await?;
            let Some(opponent) = find_best_match(entry.rating, &candidates) else {
                return Ok(MatchCheck::Searching);
            };
            match create_battle(state, player_id, opponent.player_id).await {
                Ok(battle) => Ok(MatchCheck::Matched(battle)),
                Err(ArenaError::RaceLost) => Ok(MatchCheck::Searching),
                Err(e) => Err(e),
            }
        }
    }
}

/// Release pairs `player_id` claimed but never finished creating, e.g. when
/// its search was cancelled mid-creation.
pub async fn release_stale_claims(state: &AppState, player_id: i64) -> Result<usize> {
    let released = db::release_claims_by(&state.db, player_id).await?;
    for &id in &released {
        publish(state, id, Some(QueueStatus::Searching), None);
    }
    if !released.is_empty() {
        tracing::info!(player_id, count = released.len(), "released unfinished claim");
    }
    Ok(released.len())
}

/// Poll until matched or until the matchmaking timeout, waking early on queue changes.
///
/// On a match the player's own queue row is removed. On timeout, or when
/// battle creation fails for a reason retrying will not fix, the player
/// leaves the queue and the error is returned.
pub async fn await_match(state: &AppState, player_id: i64) -> Result<BattleRow> {
    let timings = &state.config.timings;
    let mut changes = state.notifier.subscribe();
    let mut tick = tokio::time::interval(timings.queue_poll_interval);
    let deadline = tokio::time::sleep(timings.matchmaking_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                leave_queue(state, player_id).await?;
                tracing::info!(player_id, "no opponent found");
                return Err(ArenaError::Timeout(TimeoutKind::Matchmaking));
            }
            _ = tick.tick() => {}
            change = changes.recv() => match change {
                Ok(RowChange::MatchAborted { player_id: p, reason }) if p == player_id => {
                    // Still searching means nobody else claimed us since the release.
                    if db::delete_searching_entry(&state.db, player_id).await? > 0 {
                        publish(state, player_id, None, None);
                        tracing::info!(player_id, %reason, "opponent could not create the battle");
                        return Err(ArenaError::MatchAborted(reason));
                    }
                }
                Ok(RowChange::Queue { .. }) | Err(RecvError::Lagged(_)) => {}
                Ok(_) => continue,
                Err(RecvError::Closed) => return Err(ArenaError::Timeout(TimeoutKind::Matchmaking)),
            },
        }

        match check_match(state, player_id).await {
            Ok(MatchCheck::Matched(battle)) => {
                db::delete_queue_entry(&state.db, player_id).await?;
                tracing::info!(player_id, battle_id = %battle.id, "match observed");
                return Ok(battle);
            }
            Ok(MatchCheck::Searching) => {}
            Ok(MatchCheck::Gone) => {
                return Err(ArenaError::NotFound(format!("queue entry {player_id}")));
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(player_id, error = %e, "queue check failed, retrying");
            }
            Err(e) => {
                leave_queue(state, player_id).await?;
                tracing::warn!(player_id, error = %e, "battle creation failed, search ended");
                return Err(e);
            }
        }
    }
}
