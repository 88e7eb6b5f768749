//! Persisted rating and XP updates.
//!
//! Ratings are read inside the same transaction that writes them, and XP is
//! updated in place, so concurrent outcomes never work from a stale copy.

use codeduel_core::elo::{self, Finish};
use sqlx::SqlitePool;

use crate::db;
use crate::error::{ArenaError, Result};

/// What one player got out of a battle.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerChange {
    pub player_id: i64,
    pub rating_before: i32,
    pub rating_after: i32,
    pub xp_delta: f64,
    pub xp_after: f64,
}

impl PlayerChange {
    pub fn rating_change(&self) -> i32 {
        self.rating_after - self.rating_before
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeChange {
    pub winner: PlayerChange,
    pub loser: PlayerChange,
}

/// Winner beat loser on the problem.
pub async fn process_match_outcome(
    pool: &SqlitePool,
    winner_id: i64,
    loser_id: i64,
) -> Result<OutcomeChange> {
    apply_outcome(pool, winner_id, loser_id, Finish::Lost).await
}

/// `quitter` left the battle; the quit penalty replaces the losing reward.
pub async fn process_quit(
    pool: &SqlitePool,
    quitter_id: i64,
    winner_id: i64,
) -> Result<OutcomeChange> {
    apply_outcome(pool, winner_id, quitter_id, Finish::Quit).await
}

/// Every judged submission earns XP, whatever the verdict. Returns the new XP.
pub async fn add_submission_xp(pool: &SqlitePool, player_id: i64) -> Result<f64> {
    db::add_xp(pool, player_id, elo::SUBMISSION_XP)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {player_id}")))
}

async fn apply_outcome(
    pool: &SqlitePool,
    winner_id: i64,
    loser_id: i64,
    finish: Finish,
) -> Result<OutcomeChange> {
    if winner_id == loser_id {
        return Err(ArenaError::Validation("a player cannot beat themselves".into()));
    }

    let mut tx = pool.begin().await?;

    let winner = db::get_player(&mut *tx, winner_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {winner_id}")))?;
    let loser = db::get_player(&mut *tx, loser_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {loser_id}")))?;

    let deltas = elo::match_deltas(winner.rating, loser.rating, finish);

    db::set_rating(&mut *tx, winner_id, deltas.winner_rating, true).await?;
    db::set_rating(&mut *tx, loser_id, deltas.loser_rating, false).await?;
    let winner_xp = db::add_xp(&mut *tx, winner_id, deltas.winner_xp)
        .await?
        .unwrap_or_default();
    let loser_xp = db::add_xp(&mut *tx, loser_id, deltas.loser_xp)
        .await?
        .unwrap_or_default();

    tx.commit().await?;

    tracing::info!(
        winner_id,
        loser_id,
        ?finish,
        winner_rating = deltas.winner_rating,
        loser_rating = deltas.loser_rating,
        "ratings applied"
    );

    Ok(OutcomeChange {
        winner: PlayerChange {
            player_id: winner_id,
            rating_before: winner.rating,
            rating_after: deltas.winner_rating,
            xp_delta: deltas.winner_xp,
            xp_after: winner_xp,
        },
        loser: PlayerChange {
            player_id: loser_id,
            rating_before: loser.rating,
            rating_after: deltas.loser_rating,
            xp_delta: deltas.loser_xp,
            xp_after: loser_xp,
        },
    })
}
