use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a judge problem by contest and index, e.g. `1520` + `"A"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProblemKey {
    pub contest_id: i64,
    pub index: String,
}

impl ProblemKey {
    pub fn new(contest_id: i64, index: impl Into<String>) -> Self {
        Self {
            contest_id,
            index: index.into(),
        }
    }
}

impl fmt::Display for ProblemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.contest_id, self.index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProblemKind {
    Programming,
    Question,
}

/// One entry of the external problem corpus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub key: ProblemKey,
    pub name: String,
    pub kind: ProblemKind,
    /// Unrated problems are never selected.
    pub rating: Option<i32>,
    pub tags: Vec<String>,
    pub solved_count: u32,
}

/// Full problem description as returned by the problem provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemDetails {
    pub name: String,
    pub rating: Option<i32>,
    pub tags: Vec<String>,
    pub statement: Option<String>,
    pub examples: Vec<Example>,
    pub constraints: Option<String>,
    pub time_limit: Option<String>,
    pub memory_limit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub input: String,
    pub output: String,
}

/// A submission from a player's judge history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub problem: ProblemKey,
    /// Unix seconds.
    pub created_at: i64,
    /// Raw judge verdict; `None` while still queued.
    pub verdict: Option<String>,
}

/// The problems a player has an accepted submission for.
pub fn solved_set(history: &[Submission]) -> HashSet<ProblemKey> {
    history
        .iter()
        .filter(|s| s.verdict.as_deref() == Some("OK"))
        .map(|s| s.problem.clone())
        .collect()
}
