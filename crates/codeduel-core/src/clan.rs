use serde::{Deserialize, Serialize};

use crate::problem::ProblemKey;

/// Number of problems in a clan battle.
pub const CLAN_PROBLEM_COUNT: usize = 5;

/// Whether the clan `own` creates the battle against `opponent`.
///
/// The lexicographically smaller id creates; the other side waits for the
/// battle to appear.
pub fn creates_battle(own: &str, opponent: &str) -> bool {
    own < opponent
}

/// A problem slot in a clan battle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClanProblem {
    pub position: i64,
    pub key: ProblemKey,
    pub name: String,
    pub rating: i32,
    pub points: i64,
}

/// The fixed problem set every clan battle is played on.
pub fn clan_problem_set() -> Vec<ClanProblem> {
    [
        (4, "A", "Watermelon", 800, 100),
        (71, "A", "Way Too Long Words", 800, 100),
        (158, "A", "Next Round", 800, 150),
        (231, "A", "Team", 800, 150),
        (282, "A", "Bit++", 800, 200),
    ]
    .into_iter()
    .enumerate()
    .map(|(i, (contest, index, name, rating, points))| ClanProblem {
        position: i as i64,
        key: ProblemKey::new(contest, index),
        name: name.to_string(),
        rating,
        points,
    })
    .collect()
}
