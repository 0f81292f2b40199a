use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use questline_common::QuestlineError;

/// Wrapper so engine errors map onto HTTP responses at one place.
pub struct ApiError(pub QuestlineError);

impl From<QuestlineError> for ApiError {
    fn from(e: QuestlineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QuestlineError::NotFound(_) => StatusCode::NOT_FOUND,
            QuestlineError::InvalidToken | QuestlineError::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            QuestlineError::ScopeViolation(_) => StatusCode::FORBIDDEN,
            QuestlineError::InvalidTransition(_)
            | QuestlineError::StationMismatch { .. }
            | QuestlineError::CapacityExceeded
            | QuestlineError::AlreadyFinished
            | QuestlineError::AlreadyRegistered => StatusCode::CONFLICT,
            QuestlineError::Storage(_) | QuestlineError::Anyhow(_) => {
                error!(error = %self.0, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}
