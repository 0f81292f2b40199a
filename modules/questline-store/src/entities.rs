//! Entity records held by the state store.
//!
//! `progress`, `flags`, `payload` and `config` fields are opaque JSON maps
//! passed through unchanged by the engine; only the dialogue gate evaluator
//! reads specific keys, through its accessor functions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use questline_common::{
    Audience, ContentBlockId, DialogueKind, EventId, MessageId, PlayerId, PlayerRole, StationId,
    TeamId, TeamState, ThreadId, VisitId, VisitState,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub slug: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub event_id: EventId,
    pub name: String,
    pub status: String,
    pub score_total: f64,
    pub current_state: TeamState,
    pub current_station_id: Option<StationId>,
    pub progress: Value,
    pub scan_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub event_id: EventId,
    /// Opaque verified external identity, unique within an event.
    pub external_id: String,
    pub team_id: Option<TeamId>,
    pub role: Option<PlayerRole>,
    pub progress: Value,
    pub flags: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub id: StationId,
    pub event_id: EventId,
    pub name: String,
    /// Max concurrent non-finished visits.
    pub capacity: i32,
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationVisit {
    pub id: VisitId,
    pub event_id: EventId,
    pub team_id: TeamId,
    pub station_id: StationId,
    pub state: VisitState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub points_awarded: f64,
    pub host_notes: Option<String>,
    pub host_rating: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: ContentBlockId,
    pub event_id: EventId,
    pub key: String,
    pub kind: String,
    pub payload: Value,
    pub audience: Audience,
    pub station_id: Option<StationId>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

/// The idempotency record: a content block reached a (team, player?) target.
/// A null `player_id` (team-wide delivery) is its own key, distinct from any
/// player-specific delivery of the same block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub event_id: EventId,
    pub content_block_id: ContentBlockId,
    pub team_id: TeamId,
    pub player_id: Option<PlayerId>,
    pub delivered_at: DateTime<Utc>,
    pub seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueThread {
    pub id: ThreadId,
    pub event_id: EventId,
    pub key: String,
    pub kind: DialogueKind,
    pub title: String,
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueMessage {
    pub id: MessageId,
    pub event_id: EventId,
    pub thread_id: ThreadId,
    /// The content block carrying this message's deliverable payload. Both
    /// leaked and interactive flows record deliveries against it, so the
    /// idempotency key is uniform across the two.
    pub content_block_id: ContentBlockId,
    pub audience: Audience,
    pub payload: Value,
    pub order_index: i32,
    /// Keyword/flag predicates deciding eligibility; None means ungated.
    pub gate_rules: Option<Value>,
    /// Flags set on the player when this message is selected.
    pub flag_effects: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// A player's post-visit rating of the station and its host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub id: i64,
    pub event_id: EventId,
    pub visit_id: VisitId,
    pub player_id: PlayerId,
    pub station_rating: i32,
    pub host_rating: i32,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- Insert inputs ---
// The store assigns ids and timestamps; callers build these.

#[derive(Debug, Clone)]
pub struct NewTeam {
    pub event_id: EventId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewPlayer {
    pub event_id: EventId,
    pub external_id: String,
    pub team_id: Option<TeamId>,
    pub role: Option<PlayerRole>,
}

#[derive(Debug, Clone)]
pub struct NewStation {
    pub event_id: EventId,
    pub name: String,
    pub capacity: i32,
}

#[derive(Debug, Clone)]
pub struct NewVisit {
    pub event_id: EventId,
    pub team_id: TeamId,
    pub station_id: StationId,
    pub state: VisitState,
}

#[derive(Debug, Clone)]
pub struct NewContentBlock {
    pub event_id: EventId,
    pub key: String,
    pub kind: String,
    pub payload: Value,
    pub audience: Audience,
    pub station_id: Option<StationId>,
}

#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub event_id: EventId,
    pub content_block_id: ContentBlockId,
    pub team_id: TeamId,
    pub player_id: Option<PlayerId>,
}

#[derive(Debug, Clone)]
pub struct NewThread {
    pub event_id: EventId,
    pub key: String,
    pub kind: DialogueKind,
    pub title: String,
    pub config: Value,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub event_id: EventId,
    pub thread_id: ThreadId,
    pub content_block_id: ContentBlockId,
    pub audience: Audience,
    pub payload: Value,
    pub order_index: i32,
    pub gate_rules: Option<Value>,
    pub flag_effects: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewRating {
    pub event_id: EventId,
    pub visit_id: VisitId,
    pub player_id: PlayerId,
    pub station_rating: i32,
    pub host_rating: i32,
    pub comment: Option<String>,
}
