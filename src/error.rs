// Error taxonomy for the live engine, shared by the store, the service and the API.

use crate::engine::lifecycle::SessionStatus;

/// Every rejection a caller can receive. All of them are recoverable and
/// scoped to the single action that produced them.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("session not found")]
    SessionNotFound,
    #[error("operation '{operation}' is not allowed while the session is {status}")]
    InvalidSessionState {
        operation: &'static str,
        status: SessionStatus,
    },
    #[error("invalid {field}: {reason}")]
    ValidationFailed { field: String, reason: String },
    #[error("question already answered")]
    DuplicateAnswer,
    #[error("answer window closed")]
    AnswerWindowClosed,
    #[error("territory already claimed")]
    TerritoryAlreadyClaimed,
    #[error("player not found")]
    PlayerNotFound,
    #[error("question not found")]
    QuestionNotFound,
    #[error("territory not found")]
    TerritoryNotFound,
    #[error("no unspent correct answer can fund this claim")]
    ClaimNotEarned,
    #[error("you do not own this session")]
    Forbidden,
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl GameError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        GameError::ValidationFailed {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(operation: &'static str, status: SessionStatus) -> Self {
        GameError::InvalidSessionState { operation, status }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            GameError::SessionNotFound => "session_not_found",
            GameError::InvalidSessionState { .. } => "invalid_session_state",
            GameError::ValidationFailed { .. } => "validation_failed",
            GameError::DuplicateAnswer => "duplicate_answer",
            GameError::AnswerWindowClosed => "answer_window_closed",
            GameError::TerritoryAlreadyClaimed => "territory_already_claimed",
            GameError::PlayerNotFound => "player_not_found",
            GameError::QuestionNotFound => "question_not_found",
            GameError::TerritoryNotFound => "territory_not_found",
            GameError::ClaimNotEarned => "claim_not_earned",
            GameError::Forbidden => "forbidden",
            GameError::Storage(_) => "storage_unavailable",
        }
    }
}

/// True when a sqlx error is a UNIQUE constraint violation.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}
