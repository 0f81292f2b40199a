//! Identity & scope resolution.
//!
//! Two credential kinds: session tokens (JWT, carried by every request and
//! resolved to a [`Scope`]) and team scan tokens (HMAC-signed strings encoded
//! into the QR code a host scans when a team arrives at a station). Both
//! enforce a 24-hour maximum age.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use questline_common::{
    EventId, PlayerId, QuestlineError, Scope, StationId, TeamId, UserRole,
};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_DURATION_SECS: i64 = 24 * 3600;
const SCAN_TOKEN_MAX_AGE_SECS: i64 = 24 * 3600;

// --- Session tokens ---

/// JWT claims stored in a session token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionClaims {
    pub sub: String,
    pub event_id: EventId,
    pub role: UserRole,
    pub team_id: Option<TeamId>,
    pub player_id: Option<PlayerId>,
    pub station_id: Option<StationId>,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

/// Issues and verifies session tokens. The identity-proofing handshake that
/// establishes `sub` happens upstream; this service only binds the verified
/// identity to a scope for the 24-hour window.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl TokenService {
    pub fn new(secret: &str, issuer: String) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
        }
    }

    pub fn issue(&self, external_id: &str, scope: &Scope) -> Result<String, QuestlineError> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: external_id.to_string(),
            event_id: scope.event_id,
            role: scope.role,
            team_id: scope.team_id,
            player_id: scope.player_id,
            station_id: scope.station_id,
            exp: (now + chrono::Duration::seconds(TOKEN_DURATION_SECS)).timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| QuestlineError::InvalidToken)
    }

    /// Verify a session token and resolve it to a scope.
    pub fn verify(&self, token: &str) -> Result<(String, Scope), QuestlineError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<SessionClaims>(token, &self.decoding_key, &validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => QuestlineError::TokenExpired,
                _ => QuestlineError::InvalidToken,
            },
        )?;

        let c = data.claims;
        let scope = Scope {
            event_id: c.event_id,
            role: c.role,
            team_id: c.team_id,
            player_id: c.player_id,
            station_id: c.station_id,
        };
        Ok((c.sub, scope))
    }
}

// --- Team scan tokens ---

/// Signs and verifies team scan tokens of the form
/// `{event_id}:{team_id}:{issued_at}:{signature}`.
#[derive(Clone)]
pub struct ScanTokenSigner {
    secret: String,
}

impl ScanTokenSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn issue(&self, event_id: EventId, team_id: TeamId) -> String {
        self.issue_at(event_id, team_id, Utc::now())
    }

    pub fn issue_at(&self, event_id: EventId, team_id: TeamId, issued_at: DateTime<Utc>) -> String {
        let payload = format!("{event_id}:{team_id}:{}", issued_at.timestamp());
        let sig = self.sign(&payload);
        format!("{payload}:{sig}")
    }

    /// Verify a scan token and return the (event, team) it names.
    pub fn verify(&self, token: &str) -> Result<(EventId, TeamId), QuestlineError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(EventId, TeamId), QuestlineError> {
        let parts: Vec<&str> = token.splitn(4, ':').collect();
        if parts.len() != 4 {
            return Err(QuestlineError::InvalidToken);
        }

        let event_id: EventId = parts[0].parse().map_err(|_| QuestlineError::InvalidToken)?;
        let team_id: TeamId = parts[1].parse().map_err(|_| QuestlineError::InvalidToken)?;
        let issued_ts: i64 = parts[2].parse().map_err(|_| QuestlineError::InvalidToken)?;

        let payload = format!("{event_id}:{team_id}:{issued_ts}");
        let expected = self.sign(&payload);
        if !constant_time_eq(parts[3].as_bytes(), expected.as_bytes()) {
            return Err(QuestlineError::InvalidToken);
        }

        if now.timestamp() - issued_ts > SCAN_TOKEN_MAX_AGE_SECS {
            return Err(QuestlineError::TokenExpired);
        }

        Ok((event_id, team_id))
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Constant-time comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
