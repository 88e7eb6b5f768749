use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use codeduel_core::selection::SelectError;
use serde_json::json;
use thiserror::Error;

/// Which bounded wait ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Matchmaking,
    ClanBattleWait,
    Verdict,
}

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("{0}")]
    Validation(String),

    /// A conditional update matched no rows: someone else got there first.
    #[error("lost the race for this update")]
    RaceLost,

    #[error("{0} not found")]
    NotFound(String),

    #[error("external provider error: {0}")]
    ExternalProvider(String),

    #[error("timed out: {0:?}")]
    Timeout(TimeoutKind),

    /// The other side of a claimed pair could not create the battle.
    #[error("match creation failed: {0}")]
    MatchAborted(String),

    #[error("partial write rolled back: {0}")]
    PartialWriteFailure(String),

    #[error("no problems rated between {low} and {high}")]
    NoProblemsInRange { low: i32, high: i32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<SelectError> for ArenaError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoProblemsInRange { low, high } => {
                ArenaError::NoProblemsInRange { low, high }
            }
        }
    }
}

impl From<reqwest::Error> for ArenaError {
    fn from(e: reqwest::Error) -> Self {
        ArenaError::ExternalProvider(e.to_string())
    }
}

impl ArenaError {
    /// Whether this is a unique-constraint violation raised by the store.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            ArenaError::Database(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }

    /// Worth another try on the next poll rather than ending a search.
    pub fn is_transient(&self) -> bool {
        matches!(self, ArenaError::RaceLost | ArenaError::Database(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ArenaError::Validation(_) => StatusCode::BAD_REQUEST,
            ArenaError::RaceLost => StatusCode::CONFLICT,
            ArenaError::NotFound(_) => StatusCode::NOT_FOUND,
            ArenaError::ExternalProvider(_) => StatusCode::BAD_GATEWAY,
            ArenaError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ArenaError::NoProblemsInRange { .. } | ArenaError::MatchAborted(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ArenaError::PartialWriteFailure(_) | ArenaError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ArenaError {
    fn into_response(self) -> Response {
        if matches!(self, ArenaError::Database(_) | ArenaError::PartialWriteFailure(_)) {
            tracing::error!(error = %self, "request failed");
        }
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T, E = ArenaError> = std::result::Result<T, E>;
