use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Battle state machine. Terminal states are never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    Waiting,
    RequestSent,
    Preparing,
    Active,
    InProgress,
    Completed,
    Declined,
    Abandoned,
}

impl BattleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleStatus::Waiting => "waiting",
            BattleStatus::RequestSent => "request_sent",
            BattleStatus::Preparing => "preparing",
            BattleStatus::Active => "active",
            BattleStatus::InProgress => "in_progress",
            BattleStatus::Completed => "completed",
            BattleStatus::Declined => "declined",
            BattleStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BattleStatus::Completed | BattleStatus::Declined | BattleStatus::Abandoned
        )
    }

    /// The battle clock is running.
    pub fn is_running(&self) -> bool {
        matches!(self, BattleStatus::Active | BattleStatus::InProgress)
    }

    /// Statuses that count as "ongoing" for the one-battle-per-pair rule.
    pub fn open() -> &'static [BattleStatus] {
        &[
            BattleStatus::Waiting,
            BattleStatus::RequestSent,
            BattleStatus::Preparing,
            BattleStatus::Active,
            BattleStatus::InProgress,
        ]
    }
}

impl fmt::Display for BattleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for BattleStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "waiting" => BattleStatus::Waiting,
            "request_sent" => BattleStatus::RequestSent,
            "preparing" => BattleStatus::Preparing,
            "active" => BattleStatus::Active,
            "in_progress" => BattleStatus::InProgress,
            "completed" => BattleStatus::Completed,
            "declined" => BattleStatus::Declined,
            "abandoned" => BattleStatus::Abandoned,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Matchmaking queue row state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Searching,
    Creating,
    Matched,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Searching => "searching",
            QueueStatus::Creating => "creating",
            QueueStatus::Matched => "matched",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "searching" => QueueStatus::Searching,
            "creating" => QueueStatus::Creating,
            "matched" => QueueStatus::Matched,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Global queue (ranked) or friend challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleKind {
    Global,
    Local,
}

impl BattleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleKind::Global => "global",
            BattleKind::Local => "local",
        }
    }
}

impl FromStr for BattleKind {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(BattleKind::Global),
            "local" => Ok(BattleKind::Local),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Persisted score of one side (a player, or a whole clan).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideScore<Id> {
    pub id: Id,
    pub solved: i64,
    /// Seconds; `None` when nothing was solved.
    pub time_taken: Option<i64>,
}

/// More solved problems wins; equal counts go to the lower time taken.
/// Returns `None` for a draw.
pub fn decide_winner<Id: Clone>(a: &SideScore<Id>, b: &SideScore<Id>) -> Option<Id> {
    match a.solved.cmp(&b.solved) {
        Ordering::Greater => return Some(a.id.clone()),
        Ordering::Less => return Some(b.id.clone()),
        Ordering::Equal => {}
    }
    if a.solved == 0 {
        return None;
    }
    match (a.time_taken, b.time_taken) {
        (Some(ta), Some(tb)) if ta < tb => Some(a.id.clone()),
        (Some(ta), Some(tb)) if tb < ta => Some(b.id.clone()),
        (Some(_), None) => Some(a.id.clone()),
        (None, Some(_)) => Some(b.id.clone()),
        _ => None,
    }
}

/// Seconds left on a battle clock, derived from the shared `start_time`.
/// All timestamps are unix milliseconds.
pub fn remaining_seconds(duration_seconds: i64, start_time: Option<i64>, now: i64) -> i64 {
    match start_time {
        Some(start) => (duration_seconds - (now - start) / 1000).clamp(0, duration_seconds),
        None => duration_seconds,
    }
}
