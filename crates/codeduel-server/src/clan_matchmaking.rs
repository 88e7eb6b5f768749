//! Clan matchmaking: first come, first matched.
//!
//! Both clans' rows are marked `matched` with a cross-reference. The clan with
//! the lexicographically smaller id then creates the battle; the other polls
//! for it a bounded number of times and gives up without taking over.

use std::collections::HashSet;

use codeduel_core::QueueStatus;
use codeduel_core::clan::creates_battle;
use tokio::sync::broadcast::error::RecvError;

use crate::battle;
use crate::db::{self, ClanBattleRow, ClanQueueRow};
use crate::error::{ArenaError, Result, TimeoutKind};
use crate::notify::RowChange;
use crate::state::AppState;

fn publish(state: &AppState, clan_id: &str, status: Option<QueueStatus>) {
    state.notifier.publish(RowChange::ClanQueue {
        clan_id: clan_id.to_string(),
        status,
    });
}

/// Queue a clan with the members it fields. Strength is their mean rating.
pub async fn join_clan_queue(state: &AppState, clan_id: &str, members: &[i64]) -> Result<ClanQueueRow> {
    if !db::clan_exists(&state.db, clan_id).await? {
        return Err(ArenaError::NotFound(format!("clan {clan_id}")));
    }
    if members.is_empty() {
        return Err(ArenaError::Validation("select at least one member".into()));
    }

    let mut seen = HashSet::with_capacity(members.len());
    if let Some(id) = members.iter().find(|id| !seen.insert(**id)) {
        return Err(ArenaError::Validation(format!("player {id} is selected more than once")));
    }

    let roster = db::clan_members(&state.db, clan_id).await?;
    let mut total = 0i64;
    for id in members {
        let member = roster
            .iter()
            .find(|p| p.id == *id)
            .ok_or_else(|| ArenaError::Validation(format!("player {id} is not in clan {clan_id}")))?;
        total += i64::from(member.rating);
    }
    let strength = (total / members.len() as i64) as i32;

    let mut tx = state.db.begin().await?;
    db::delete_clan_queue_entry(&mut *tx, clan_id).await?;
    db::insert_clan_queue_entry(&mut *tx, clan_id, strength, members).await?;
    let entry = db::get_clan_queue_entry(&mut *tx, clan_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("clan queue entry {clan_id}")))?;
    tx.commit().await?;

    tracing::info!(clan_id, strength, members = members.len(), "clan joined queue");
    publish(state, clan_id, Some(QueueStatus::Searching));
    Ok(entry)
}

pub async fn leave_clan_queue(state: &AppState, clan_id: &str) -> Result<bool> {
    let removed = db::delete_clan_queue_entry(&state.db, clan_id).await? > 0;
    if removed {
        publish(state, clan_id, None);
    }
    Ok(removed)
}

/// Both sides of a clan match.
#[derive(Debug, Clone)]
pub struct ClanPairing {
    pub own: ClanQueueRow,
    pub opponent: ClanQueueRow,
}

/// Pair `clan_id` with the oldest searching clan.
///
/// If the clan is already matched, returns that pairing again.
pub async fn find_clan_match(state: &AppState, clan_id: &str) -> Result<Option<ClanPairing>> {
    let own = db::get_clan_queue_entry(&state.db, clan_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("clan queue entry {clan_id}")))?;

    if own.status == QueueStatus::Matched {
        let Some(opponent_id) = own.matched_with_clan_id.clone() else {
            return Ok(None);
        };
        let opponent = db::get_clan_queue_entry(&state.db, &opponent_id).await?;
        return Ok(opponent.map(|opponent| ClanPairing { own, opponent }));
    }

    for candidate in db::searching_clans(&state.db, clan_id).await? {
        let mut tx = state.db.begin().await?;
        let mine = db::match_clan_entry(&mut *tx, clan_id, &candidate.clan_id).await?;
        let theirs = db::match_clan_entry(&mut *tx, &candidate.clan_id, clan_id).await?;
        if mine + theirs != 2 {
            tx.rollback().await?;
            if mine == 0 {
                // Someone matched us in the meantime; the next check returns it.
                return Ok(None);
            }
            continue;
        }
        tx.commit().await?;

        tracing::info!(clan_id, opponent = %candidate.clan_id, "clans matched");
        publish(state, clan_id, Some(QueueStatus::Matched));
        publish(state, &candidate.clan_id, Some(QueueStatus::Matched));

        let own = refreshed(state, clan_id).await?;
        let opponent = refreshed(state, &candidate.clan_id).await?;
        return Ok(Some(ClanPairing { own, opponent }));
    }
    Ok(None)
}

async fn refreshed(state: &AppState, clan_id: &str) -> Result<ClanQueueRow> {
    db::get_clan_queue_entry(&state.db, clan_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("clan queue entry {clan_id}")))
}

/// Create the battle for a pairing. Only the creating side may call this.
pub async fn create_clan_battle(state: &AppState, pairing: &ClanPairing) -> Result<ClanBattleRow> {
    if !creates_battle(&pairing.own.clan_id, &pairing.opponent.clan_id) {
        return Err(ArenaError::Validation(format!(
            "clan {} waits for {} to create the battle",
            pairing.own.clan_id, pairing.opponent.clan_id
        )));
    }

    let battle = battle::create_clan_battle(state, &pairing.own, &pairing.opponent).await?;

    for clan_id in [&pairing.own.clan_id, &pairing.opponent.clan_id] {
        db::delete_clan_queue_entry(&state.db, clan_id).await?;
        publish(state, clan_id, None);
    }
    Ok(battle)
}

/// Poll for the battle the other clan is creating. Gives up after the
/// configured number of attempts.
pub async fn wait_for_clan_battle(
    state: &AppState,
    clan_id: &str,
    opponent_id: &str,
) -> Result<ClanBattleRow> {
    let timings = &state.config.timings;
    for attempt in 1..=timings.clan_wait_attempts {
        if let Some(battle) = db::open_clan_battle_for_pair(&state.db, clan_id, opponent_id).await? {
            return Ok(battle);
        }
        if attempt < timings.clan_wait_attempts {
            tokio::time::sleep(timings.clan_wait_interval).await;
        }
    }
    tracing::warn!(clan_id, opponent_id, "opponent clan never created the battle");
    Err(ArenaError::Timeout(TimeoutKind::ClanBattleWait))
}

/// Search until a clan battle exists for `clan_id` or the matchmaking timeout passes.
pub async fn await_clan_match(state: &AppState, clan_id: &str) -> Result<ClanBattleRow> {
    let timings = &state.config.timings;
    let mut changes = state.notifier.subscribe();
    let mut tick = tokio::time::interval(timings.queue_poll_interval);
    let deadline = tokio::time::sleep(timings.matchmaking_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                leave_clan_queue(state, clan_id).await?;
                return Err(ArenaError::Timeout(TimeoutKind::Matchmaking));
            }
            _ = tick.tick() => {}
            change = changes.recv() => match change {
                Ok(RowChange::ClanQueue { .. }) | Err(RecvError::Lagged(_)) => {}
                Ok(c) if c.touches_clan(clan_id) => {}
                Ok(_) => continue,
                Err(RecvError::Closed) => return Err(ArenaError::Timeout(TimeoutKind::Matchmaking)),
            },
        }

        if let Some(battle) = db::active_clan_battle(&state.db, clan_id).await? {
            db::delete_clan_queue_entry(&state.db, clan_id).await?;
            return Ok(battle);
        }

        let pairing = match find_clan_match(state, clan_id).await {
            Ok(Some(pairing)) => pairing,
            Ok(None) => continue,
            Err(e @ ArenaError::NotFound(_)) => {
                // Our row is gone: the creator cleared it, or it was swept.
                return match db::active_clan_battle(&state.db, clan_id).await? {
                    Some(battle) => Ok(battle),
                    None => Err(e),
                };
            }
            Err(e) => {
                tracing::warn!(clan_id, error = %e, "clan queue check failed");
                continue;
            }
        };

        if creates_battle(&pairing.own.clan_id, &pairing.opponent.clan_id) {
            return create_clan_battle(state, &pairing).await;
        }
        let result = wait_for_clan_battle(state, clan_id, &pairing.opponent.clan_id).await;
        db::delete_clan_queue_entry(&state.db, clan_id).await?;
        return result;
    }
}
