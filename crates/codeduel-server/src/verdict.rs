//! Polling the judge for the verdict of a fresh submission.

use std::time::Duration;

use codeduel_core::verdict::resolve;
use codeduel_core::{ProblemKey, Verdict};

use crate::battle::{self, Completion};
use crate::db;
use crate::error::{ArenaError, Result, TimeoutKind};
use crate::provider::ProblemProvider;
use crate::rating;
use crate::state::AppState;

/// Poll `handle`'s history until the newest submission for `problem` made after
/// `after` (unix seconds) has a final verdict.
///
/// Provider failures during polling count as an empty attempt.
pub async fn poll_for_verdict(
    provider: &dyn ProblemProvider,
    handle: &str,
    problem: &ProblemKey,
    after: i64,
    attempts: u32,
    interval: Duration,
) -> Result<Verdict> {
    for attempt in 1..=attempts {
        match provider.submissions(handle).await {
            Ok(history) => {
                if let Some(verdict) = resolve(&history, problem, after) {
                    tracing::debug!(handle, %problem, attempt, ?verdict, "verdict resolved");
                    return Ok(verdict);
                }
            }
            Err(e) => tracing::warn!(handle, attempt, error = %e, "submission poll failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(ArenaError::Timeout(TimeoutKind::Verdict))
}

#[derive(Debug, Clone)]
pub struct VerdictOutcome {
    pub verdict: Verdict,
    /// XP after the submission reward.
    pub xp: f64,
    /// Set when this verdict closed the battle.
    pub completion: Option<Completion>,
}

/// Judge a player's submission in a 1v1 battle and apply what follows from it.
pub async fn check_battle_verdict(
    state: &AppState,
    battle_id: &str,
    player_id: i64,
    submitted_at: i64,
) -> Result<VerdictOutcome> {
    let battle = battle::get_battle(&state.db, battle_id).await?;
    if battle.opponent_of(player_id).is_none() {
        return Err(ArenaError::Validation("not a participant of this battle".into()));
    }
    let problem = battle
        .problem
        .as_ref()
        .ok_or_else(|| ArenaError::Validation("battle has no problem yet".into()))?;
    let player = db::get_player(&state.db, player_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {player_id}")))?;

    let timings = &state.config.timings;
    let verdict = poll_for_verdict(
        state.problems.as_ref(),
        &player.handle,
        &problem.key,
        submitted_at,
        timings.verdict_attempts,
        timings.verdict_interval,
    )
    .await?;

    let xp = rating::add_submission_xp(&state.db, player_id).await?;

    let mut completion = None;
    if verdict.is_accepted() && battle::record_solve(state, battle_id, player_id).await? {
        let done = battle::complete_battle(state, battle_id).await?;
        if done.newly_completed {
            completion = Some(done);
        }
    }

    Ok(VerdictOutcome {
        verdict,
        xp,
        completion,
    })
}

/// Judge a submission for one problem of a clan battle.
pub async fn check_clan_verdict(
    state: &AppState,
    battle_id: &str,
    player_id: i64,
    position: i64,
    submitted_at: i64,
) -> Result<VerdictOutcome> {
    let problems = db::clan_problems(&state.db, battle_id).await?;
    let problem = problems
        .iter()
        .find(|p| p.position == position)
        .ok_or_else(|| ArenaError::NotFound(format!("problem {position} in battle {battle_id}")))?;
    if db::clan_participant_clan(&state.db, battle_id, player_id).await?.is_none() {
        return Err(ArenaError::Validation("not a participant of this clan battle".into()));
    }
    let player = db::get_player(&state.db, player_id)
        .await?
        .ok_or_else(|| ArenaError::NotFound(format!("player {player_id}")))?;

    let timings = &state.config.timings;
    let verdict = poll_for_verdict(
        state.problems.as_ref(),
        &player.handle,
        &problem.key,
        submitted_at,
        timings.verdict_attempts,
        timings.verdict_interval,
    )
    .await?;

    let xp = rating::add_submission_xp(&state.db, player_id).await?;
    if verdict.is_accepted() {
        battle::record_clan_solve(state, battle_id, player_id, position).await?;
    }

    Ok(VerdictOutcome {
        verdict,
        xp,
        completion: None,
    })
}
