//! Session extraction.
//!
//! Every request carries a session token — `Authorization: Bearer` or the
//! `ql_session` cookie — minted against a verified external identity. The
//! extractor resolves it to a [`Scope`]; handlers never see raw credentials.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::Response;

use questline_common::{QuestlineError, Scope};

use crate::error::ApiError;
use crate::AppState;

const COOKIE_NAME: &str = "ql_session";

/// A verified session: who is calling and what they may touch.
pub struct Session(pub Scope);

impl FromRequestParts<Arc<AppState>> for Session {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| cookie_token(parts))
            .ok_or_else(|| to_response(QuestlineError::InvalidToken))?;

        let (_external_id, scope) =
            state.tokens.verify(token).map_err(to_response)?;
        Ok(Session(scope))
    }
}

fn to_response(e: QuestlineError) -> Response {
    use axum::response::IntoResponse;
    ApiError(e).into_response()
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn cookie_token(parts: &Parts) -> Option<&str> {
    let header = parts
        .headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    parse_cookie(header, COOKIE_NAME)
}

/// Parse a specific cookie from the Cookie header string.
fn parse_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(name) {
            if let Some(value) = value.strip_prefix('=') {
                return Some(value);
            }
        }
    }
    None
}

/// Build the Set-Cookie header value for a fresh session token.
/// In release builds, adds `Secure` so the token never travels over HTTP.
pub fn session_cookie(token: &str) -> String {
    let secure = if cfg!(debug_assertions) { "" } else { "; Secure" };
    format!("{COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax{secure}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cookie_works() {
        assert_eq!(
            parse_cookie("ql_session=abc123; other=xyz", "ql_session"),
            Some("abc123")
        );
        assert_eq!(
            parse_cookie("other=xyz; ql_session=abc123", "ql_session"),
            Some("abc123")
        );
        assert_eq!(parse_cookie("other=xyz", "ql_session"), None);
    }
}
