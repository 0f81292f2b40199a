use thiserror::Error;

/// Failure taxonomy for the engine. Business-rule failures are returned to
/// the immediate caller as typed outcomes and never cross the hub boundary.
#[derive(Error, Debug)]
pub enum QuestlineError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Station is at capacity")]
    CapacityExceeded,

    #[error("Visit already finished")]
    AlreadyFinished,

    #[error("Team is assigned to a different station (expected {expected}, got {actual})")]
    StationMismatch { expected: i64, actual: i64 },

    #[error("Scope violation: {0}")]
    ScopeViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Identity already registered in this event")]
    AlreadyRegistered,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl QuestlineError {
    /// Stable machine-readable tag for API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            QuestlineError::InvalidTransition(_) => "invalid_transition",
            QuestlineError::InvalidToken => "invalid_token",
            QuestlineError::TokenExpired => "token_expired",
            QuestlineError::CapacityExceeded => "capacity_exceeded",
            QuestlineError::AlreadyFinished => "already_finished",
            QuestlineError::StationMismatch { .. } => "station_mismatch",
            QuestlineError::ScopeViolation(_) => "scope_violation",
            QuestlineError::NotFound(_) => "not_found",
            QuestlineError::AlreadyRegistered => "already_registered",
            QuestlineError::Storage(_) => "storage",
            QuestlineError::Anyhow(_) => "internal",
        }
    }
}
