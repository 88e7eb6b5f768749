use serde::{Deserialize, Serialize};

use crate::battle::{BattleKind, BattleStatus};
use crate::clan::ClanProblem;
use crate::problem::{Problem, ProblemKey};
use crate::verdict::Verdict;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    JoinQueue,
    LeaveQueue,
    JoinClanQueue {
        members: Vec<i64>,
    },
    LeaveClanQueue,
    Quit {
        battle_id: String,
    },
    /// `submitted_at` is unix seconds, captured right before submitting to the judge.
    CheckVerdict {
        battle_id: String,
        submitted_at: i64,
    },
    CheckClanVerdict {
        battle_id: String,
        position: i64,
        submitted_at: i64,
    },
    Ping,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Hello {
        handle: String,
        rating: i32,
        xp: f64,
    },
    Searching,
    MatchFound {
        battle: BattleView,
    },
    NoOpponentFound,
    /// An opponent was found but the battle could not be set up.
    MatchFailed {
        reason: String,
    },
    ClanMatchFound {
        battle_id: String,
        opponent_clan_id: String,
    },
    ClanMatchFailed {
        reason: String,
    },
    Verdict {
        battle_id: String,
        verdict: Verdict,
        xp: f64,
    },
    /// The judge did not produce a verdict in time; check the judge site.
    VerdictUnavailable {
        battle_id: String,
        message: String,
    },
    BattleEnded {
        battle_id: String,
        status: BattleStatus,
        winner_id: Option<i64>,
        rating_change: i32,
        new_rating: i32,
        xp_change: f64,
    },
    Error {
        message: String,
    },
    Pong,
}

/// The problem a 1v1 battle is played on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleProblem {
    pub key: ProblemKey,
    pub name: String,
    pub rating: Option<i32>,
    pub tags: Vec<String>,
}

impl From<&Problem> for BattleProblem {
    fn from(p: &Problem) -> Self {
        Self {
            key: p.key.clone(),
            name: p.name.clone(),
            rating: p.rating,
            tags: p.tags.clone(),
        }
    }
}

/// A 1v1 battle as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleView {
    pub id: String,
    pub kind: BattleKind,
    pub status: BattleStatus,
    pub player1_id: i64,
    pub player2_id: i64,
    pub problem: Option<BattleProblem>,
    /// Unix milliseconds.
    pub start_time: Option<i64>,
    pub duration_seconds: i64,
    pub remaining_seconds: i64,
    pub winner_id: Option<i64>,
}

/// A clan battle as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClanBattleView {
    pub id: String,
    pub clan1_id: String,
    pub clan2_id: String,
    pub status: BattleStatus,
    pub start_time: Option<i64>,
    pub duration_seconds: i64,
    pub remaining_seconds: i64,
    pub winner_clan_id: Option<String>,
    pub problems: Vec<ClanProblem>,
}

/// Leaderboard entry returned by REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub handle: String,
    pub rating: i32,
    pub xp: f64,
    pub wins: u32,
    pub losses: u32,
}

/// Player profile returned by REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub id: i64,
    pub handle: String,
    pub rating: i32,
    pub xp: f64,
    pub clan_id: Option<String>,
    pub wins: u32,
    pub losses: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClanRequest {
    pub name: String,
    pub leader_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClanCreated {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinClanRequest {
    pub player_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub challenger_id: i64,
    pub opponent_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeReply {
    pub player_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClanBattleAction {
    pub player_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RushQuery {
    pub handle: String,
    pub rating: i32,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RushProblems {
    pub problems: Vec<BattleProblem>,
    pub fell_back: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub language: String,
    pub source: String,
    pub stdin: String,
    pub expected_output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub verdict: Verdict,
    pub stdout: String,
    pub stderr: String,
}
