/// Starting ELO rating for new players
pub const DEFAULT_RATING: i32 = 1200;

/// K-factor for ELO calculation
pub const K: f64 = 32.0;

/// XP awarded to the winner of a battle.
pub const WIN_XP: f64 = 0.30;
/// XP awarded to the loser of a battle.
pub const LOSE_XP: f64 = 0.10;
/// XP applied to a player who quits. Replaces `LOSE_XP`.
pub const QUIT_XP: f64 = -0.25;
/// XP for every judged submission, whatever the verdict.
pub const SUBMISSION_XP: f64 = 0.5;

/// Probability that a player rated `rating_a` beats one rated `rating_b`.
pub fn expected_score(rating_a: i32, rating_b: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) as f64 / 400.0))
}

/// Apply one result to a rating. `actual` is 1.0 for a win and 0.0 for a loss.
pub fn new_rating(rating: i32, expected: f64, actual: f64) -> i32 {
    (rating as f64 + K * (actual - expected)).round() as i32
}

/// Add `delta` to `xp`, never going below zero.
pub fn apply_xp(xp: f64, delta: f64) -> f64 {
    (xp + delta).max(0.0)
}

/// How a battle ended for the losing side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finish {
    /// Beaten on the problem.
    Lost,
    /// Left the battle early.
    Quit,
}

/// Rating and XP deltas for both sides of a finished 1v1 battle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchDeltas {
    pub winner_rating: i32,
    pub loser_rating: i32,
    pub winner_xp: f64,
    pub loser_xp: f64,
}

/// Compute new ratings and XP deltas from the current persisted ratings.
pub fn match_deltas(winner_rating: i32, loser_rating: i32, finish: Finish) -> MatchDeltas {
    let winner_expected = expected_score(winner_rating, loser_rating);
    let loser_expected = expected_score(loser_rating, winner_rating);

    MatchDeltas {
        winner_rating: new_rating(winner_rating, winner_expected, 1.0),
        loser_rating: new_rating(loser_rating, loser_expected, 0.0),
        winner_xp: WIN_XP,
        loser_xp: match finish {
            Finish::Lost => LOSE_XP,
            Finish::Quit => QUIT_XP,
        },
    }
}
