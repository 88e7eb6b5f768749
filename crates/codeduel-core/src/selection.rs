//! Problem selection for a battle.
//!
//! Selection works on data that was already fetched: the full corpus and the
//! solved sets of both players. Fetching (and degrading a failed history fetch
//! to an empty set) is the caller's job.

use std::collections::HashSet;

use rand::RngExt;
use thiserror::Error;

use crate::problem::{Problem, ProblemKey, ProblemKind};

/// Lowest target difficulty a battle can ask for.
pub const MIN_TARGET: i32 = 800;
/// Highest target difficulty a battle can ask for.
pub const MAX_TARGET: i32 = 2400;
/// Half-width of the difficulty band around the target.
pub const BAND: i32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("no problems rated between {low} and {high}")]
    NoProblemsInRange { low: i32, high: i32 },
}

/// Outcome of a selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub problems: Vec<Problem>,
    /// Set when some picked problem may already be solved by a player.
    pub fell_back: bool,
}

pub fn clamp_target(target: i32) -> i32 {
    target.clamp(MIN_TARGET, MAX_TARGET)
}

/// Inclusive rating band for a (raw) target.
pub fn rating_band(target: i32) -> (i32, i32) {
    let t = clamp_target(target);
    (t - BAND, t + BAND)
}

/// Pick `count` problems for a battle at `target` difficulty.
///
/// Unsolved problems in the band are preferred. If there are fewer unsolved
/// problems than requested, the rest is drawn from the solved remainder of the
/// band and `fell_back` is set.
pub fn select<R: RngExt + ?Sized>(
    corpus: &[Problem],
    solved_a: &HashSet<ProblemKey>,
    solved_b: &HashSet<ProblemKey>,
    target: i32,
    count: usize,
    rng: &mut R,
) -> Result<Selection, SelectError> {
    let (low, high) = rating_band(target);

    let candidates: Vec<&Problem> = corpus
        .iter()
        .filter(|p| p.kind == ProblemKind::Programming)
        .filter(|p| p.rating.is_some_and(|r| r >= low && r <= high))
        .collect();

    if candidates.is_empty() {
        return Err(SelectError::NoProblemsInRange { low, high });
    }

    let (mut unsolved, mut solved): (Vec<&Problem>, Vec<&Problem>) = candidates
        .into_iter()
        .partition(|p| !solved_a.contains(&p.key) && !solved_b.contains(&p.key));

    let mut problems = sample(&mut unsolved, count, rng);
    let mut fell_back = false;
    if problems.len() < count {
        fell_back = true;
        let missing = count - problems.len();
        problems.extend(sample(&mut solved, missing, rng));
    }

    Ok(Selection {
        problems: problems.into_iter().cloned().collect(),
        fell_back,
    })
}

/// Uniform sample without replacement (partial Fisher-Yates).
fn sample<'a, R: RngExt + ?Sized>(
    pool: &mut [&'a Problem],
    count: usize,
    rng: &mut R,
) -> Vec<&'a Problem> {
    let n = count.min(pool.len());
    for i in 0..n {
        let j = rng.random_range(i..pool.len());
        pool.swap(i, j);
    }
    pool[..n].to_vec()
}
