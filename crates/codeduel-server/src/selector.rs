use std::collections::HashSet;

use codeduel_core::{Problem, ProblemKey};
use codeduel_core::problem::solved_set;
use codeduel_core::selection::{self, Selection};

use crate::error::{ArenaError, Result};
use crate::provider::ProblemProvider;

/// Fetch the corpus and both solved sets, then pick `count` problems.
///
/// A failed history fetch degrades to an empty solved set for that player.
/// A failed corpus fetch or an empty band fails the whole selection.
pub async fn select_problems(
    provider: &dyn ProblemProvider,
    handle_a: &str,
    handle_b: &str,
    target_rating: i32,
    count: usize,
) -> Result<Selection> {
    let (corpus, solved_a, solved_b) = tokio::join!(
        provider.corpus(),
        solved_for(provider, handle_a),
        solved_for(provider, handle_b),
    );
    let corpus = corpus?;

    let selection = {
        let mut rng = rand::rng();
        selection::select(&corpus, &solved_a, &solved_b, target_rating, count, &mut rng)?
    };

    if selection.fell_back {
        tracing::warn!(
            handle_a,
            handle_b,
            target_rating,
            "no unsolved problems left in band, picked from solved ones"
        );
    }
    Ok(selection)
}

/// The single problem a 1v1 battle is played on.
pub async fn select_one(
    provider: &dyn ProblemProvider,
    handle_a: &str,
    handle_b: &str,
    target_rating: i32,
) -> Result<Problem> {
    let selection = select_problems(provider, handle_a, handle_b, target_rating, 1).await?;
    let (low, high) = selection::rating_band(target_rating);
    selection
        .problems
        .into_iter()
        .next()
        .ok_or(ArenaError::NoProblemsInRange { low, high })
}

async fn solved_for(provider: &dyn ProblemProvider, handle: &str) -> HashSet<ProblemKey> {
    match provider.submissions(handle).await {
        Ok(history) => solved_set(&history),
        Err(e) => {
            tracing::warn!(handle, error = %e, "could not fetch submissions, assuming none solved");
            HashSet::new()
        }
    }
}
