//! Role-gated HTTP handlers. Thin wrappers: scope comes from the session
//! extractor, the engine does the work, errors map to HTTP in one place.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{AppendHeaders, IntoResponse};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use questline_common::{QuestlineError, Scope, UserRole};
use questline_engine::AudienceTarget;
use questline_store::{NewContentBlock, NewMessage, NewPlayer, NewStation, NewTeam, NewThread};

use crate::auth::{session_cookie, Session};
use crate::error::ApiError;
use crate::AppState;

pub async fn health() -> &'static str {
    "ok"
}

fn require_admin(scope: &Scope) -> Result<(), ApiError> {
    if scope.role != UserRole::Admin {
        return Err(ApiError(QuestlineError::ScopeViolation(format!(
            "admin required, session is {}",
            scope.role
        ))));
    }
    Ok(())
}

// --- Sessions ---

#[derive(Deserialize)]
pub struct SessionRequest {
    /// A previously issued credential for the verified identity. The
    /// identity-proofing handshake that produced it lives upstream.
    pub credential: String,
}

/// Exchange a verified credential for a fresh session token + cookie.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (external_id, scope) = state.tokens.verify(&req.credential)?;
    let token = state.tokens.issue(&external_id, &scope)?;
    let headers = AppendHeaders([(header::SET_COOKIE, session_cookie(&token))]);
    Ok((headers, Json(json!({"token": token, "scope": scope}))))
}

// --- Station host ---

#[derive(Deserialize)]
pub struct ScanRequest {
    pub token: String,
    pub station_id: Option<i64>,
}

/// Validate a scanned team code and show the team with its open visit here.
pub async fn station_scan(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<ScanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let station_id = resolve_station(&scope, req.station_id)?;
    let (team, visit) = state.engine.scan(&scope, &req.token, station_id).await?;
    Ok(Json(json!({
        "team": team,
        "visit_id": visit.as_ref().map(|v| v.id),
        "visit_state": visit.as_ref().map(|v| v.state),
    })))
}

#[derive(Deserialize)]
pub struct ArriveRequest {
    pub token: String,
    pub station_id: Option<i64>,
}

pub async fn visit_arrive(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<ArriveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let station_id = resolve_station(&scope, req.station_id)?;
    let visit = state.engine.arrive(&scope, &req.token, station_id).await?;
    Ok(Json(visit))
}

#[derive(Deserialize)]
pub struct VisitStartRequest {
    pub visit_id: i64,
}

pub async fn visit_start(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<VisitStartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let visit = state.engine.start_visit(&scope, req.visit_id).await?;
    Ok(Json(visit))
}

#[derive(Deserialize)]
pub struct VisitFinishRequest {
    pub visit_id: i64,
    #[serde(default)]
    pub points_awarded: f64,
    pub host_notes: Option<String>,
    pub host_rating: Option<i32>,
    /// Whether the event's closing condition now holds for this team;
    /// computed by the caller's policy, not by the engine.
    #[serde(default)]
    pub event_complete: bool,
}

pub async fn visit_finish(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<VisitFinishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let visit = state
        .engine
        .finish_visit(
            &scope,
            req.visit_id,
            req.points_awarded,
            req.host_notes,
            req.host_rating,
            req.event_complete,
        )
        .await?;
    Ok(Json(visit))
}

/// A host may cover another station; an explicit station wins, otherwise the
/// session's own station is used.
fn resolve_station(scope: &Scope, requested: Option<i64>) -> Result<i64, ApiError> {
    requested.or(scope.station_id).ok_or_else(|| {
        ApiError(QuestlineError::InvalidTransition("no station selected".into()))
    })
}

// --- Organizer ---

#[derive(Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
}

pub async fn create_team(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<CreateTeamRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&scope)?;
    let team = state
        .store
        .create_team(NewTeam { event_id: scope.event_id, name: req.name })
        .await?;
    Ok(Json(team))
}

#[derive(Deserialize)]
pub struct CreateStationRequest {
    pub name: String,
    #[serde(default = "default_capacity")]
    pub capacity: i32,
}

fn default_capacity() -> i32 {
    1
}

pub async fn create_station(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<CreateStationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&scope)?;
    let station = state
        .store
        .create_station(NewStation {
            event_id: scope.event_id,
            name: req.name,
            capacity: req.capacity,
        })
        .await?;
    Ok(Json(station))
}

#[derive(Deserialize)]
pub struct RegisterPlayerRequest {
    pub external_id: String,
    pub team_id: Option<i64>,
    pub role: Option<questline_common::PlayerRole>,
}

pub async fn register_player(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<RegisterPlayerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let player = state
        .engine
        .register_player(
            &scope,
            NewPlayer {
                event_id: scope.event_id,
                external_id: req.external_id,
                team_id: req.team_id,
                role: req.role,
            },
        )
        .await?;
    Ok(Json(player))
}

#[derive(Deserialize)]
pub struct AssignRequest {
    pub station_id: i64,
}

pub async fn assign_team(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Path(team_id): Path<i64>,
    Json(req): Json<AssignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let team = state.engine.assign_team(&scope, team_id, req.station_id).await?;
    Ok(Json(team))
}

pub async fn recall_team(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Path(team_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let team = state.engine.recall_team(&scope, team_id).await?;
    Ok(Json(team))
}

pub async fn issue_scan_token(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Path(team_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let token = state.engine.issue_scan_token(&scope, team_id).await?;
    Ok(Json(json!({"token": token})))
}

#[derive(Deserialize)]
pub struct CreateContentRequest {
    pub key: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub audience: questline_common::Audience,
    pub station_id: Option<i64>,
}

fn default_kind() -> String {
    "text".to_string()
}

pub async fn create_content(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<CreateContentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&scope)?;
    let block = state
        .store
        .create_content_block(NewContentBlock {
            event_id: scope.event_id,
            key: req.key,
            kind: req.kind,
            payload: req.payload,
            audience: req.audience,
            station_id: req.station_id,
        })
        .await?;
    Ok(Json(block))
}

/// Deliver a block now. A scheduler firing a deferred delivery posts the
/// same body to the same route.
pub async fn deliver_content(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Path(content_block_id): Path<i64>,
    Json(target): Json<AudienceTarget>,
) -> Result<impl IntoResponse, ApiError> {
    let outcomes = state.engine.deliver_now(&scope, content_block_id, target).await?;
    let created = outcomes.iter().filter(|o| o.is_created()).count();
    Ok(Json(json!({
        "resolved": outcomes.len(),
        "delivered": created,
        "already_delivered": outcomes.len() - created,
    })))
}

#[derive(Deserialize)]
pub struct CreateThreadRequest {
    pub key: String,
    pub kind: questline_common::DialogueKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

pub async fn create_thread(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<CreateThreadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&scope)?;
    let thread = state
        .store
        .create_thread(NewThread {
            event_id: scope.event_id,
            key: req.key,
            kind: req.kind,
            title: req.title,
            config: req.config,
        })
        .await?;
    Ok(Json(thread))
}

#[derive(Deserialize)]
pub struct CreateMessageRequest {
    pub content_block_id: i64,
    pub audience: questline_common::Audience,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub order_index: i32,
    pub gate_rules: Option<serde_json::Value>,
    pub flag_effects: Option<serde_json::Value>,
}

pub async fn create_message(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Path(thread_id): Path<i64>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&scope)?;
    let message = state
        .store
        .create_message(NewMessage {
            event_id: scope.event_id,
            thread_id,
            content_block_id: req.content_block_id,
            audience: req.audience,
            payload: req.payload,
            order_index: req.order_index,
            gate_rules: req.gate_rules,
            flag_effects: req.flag_effects,
        })
        .await?;
    Ok(Json(message))
}

#[derive(Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_seq_start")]
    pub seq_start: i64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub team_id: Option<i64>,
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
}

fn default_seq_start() -> i64 {
    1
}

fn default_limit() -> usize {
    100
}

/// The ordered audit stream, filterable by team and entry type.
pub async fn read_log(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Query(q): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .engine
        .read_log(&scope, q.seq_start, q.limit, q.team_id, q.entry_type.as_deref())
        .await?;
    Ok(Json(entries))
}

// --- Player ---

pub async fn leaked_thread(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.engine.leaked_messages(&scope, &key).await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
pub struct ReplyRequest {
    pub message: String,
}

pub async fn dialogue_reply(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Path(key): Path<String>,
    Json(req): Json<ReplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.engine.dialogue_reply(&scope, &key, &req.message).await?;
    Ok(Json(json!({"response": response})))
}

#[derive(Deserialize)]
pub struct RatingRequest {
    pub visit_id: i64,
    pub station_rating: i32,
    pub host_rating: i32,
    pub comment: Option<String>,
}

pub async fn submit_rating(
    State(state): State<Arc<AppState>>,
    Session(scope): Session,
    Json(req): Json<RatingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .engine
        .submit_rating(&scope, req.visit_id, req.station_rating, req.host_rating, req.comment)
        .await?;
    Ok(Json(json!({
        "rating": outcome.record(),
        "created": outcome.is_created(),
    })))
}
