//! State store port. The store is the single writer-visible source of truth;
//! components read and write through it rather than caching entity state
//! beyond one request.
//!
//! Two invariants are enforced here rather than in application logic, because
//! independent connections can race on them: delivery uniqueness
//! (unique-constraint insert) and team score totals (atomic increment).

pub mod entities;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;

use questline_common::{
    ContentBlockId, EventId, PlayerId, QuestlineError, StationId, TeamId, ThreadId, VisitId,
};

pub use entities::*;
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Outcome of a unique-constraint insert: either a fresh row, or the row
/// that already owned the key. Conflicts are not errors.
#[derive(Debug, Clone)]
pub enum Inserted<T> {
    Created(T),
    Existing(T),
}

impl<T> Inserted<T> {
    pub fn record(&self) -> &T {
        match self {
            Inserted::Created(t) | Inserted::Existing(t) => t,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Inserted::Created(_))
    }

    pub fn into_record(self) -> T {
        match self {
            Inserted::Created(t) | Inserted::Existing(t) => t,
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    // -- events --
    async fn create_event(&self, name: &str, slug: &str) -> Result<Event, QuestlineError>;

    // -- teams --
    async fn team(&self, id: TeamId) -> Result<Team, QuestlineError>;
    async fn teams_by_event(&self, event_id: EventId) -> Result<Vec<Team>, QuestlineError>;
    async fn create_team(&self, new: NewTeam) -> Result<Team, QuestlineError>;
    /// Persist team fields. `score_total` is excluded — it changes only
    /// through `add_score`, so a stale in-memory copy cannot undo a
    /// concurrent increment.
    async fn update_team(&self, team: &Team) -> Result<(), QuestlineError>;
    /// Atomic increment of the team's score. Returns the new total.
    async fn add_score(&self, team_id: TeamId, delta: f64) -> Result<f64, QuestlineError>;
    async fn set_scan_token(&self, team_id: TeamId, token: &str) -> Result<(), QuestlineError>;

    // -- players --
    async fn player(&self, id: PlayerId) -> Result<Player, QuestlineError>;
    async fn players_by_team(&self, team_id: TeamId) -> Result<Vec<Player>, QuestlineError>;
    /// Rejects with `AlreadyRegistered` when the external identity already
    /// exists in the event.
    async fn register_player(&self, new: NewPlayer) -> Result<Player, QuestlineError>;
    async fn update_player_flags(
        &self,
        player_id: PlayerId,
        flags: Value,
    ) -> Result<(), QuestlineError>;

    // -- stations --
    async fn station(&self, id: StationId) -> Result<Station, QuestlineError>;
    async fn create_station(&self, new: NewStation) -> Result<Station, QuestlineError>;

    // -- visits --
    async fn visit(&self, id: VisitId) -> Result<StationVisit, QuestlineError>;
    /// The single non-finished visit for (team, station), if any.
    async fn active_visit(
        &self,
        team_id: TeamId,
        station_id: StationId,
    ) -> Result<Option<StationVisit>, QuestlineError>;
    /// Number of non-finished visits currently at the station.
    async fn active_visit_count(&self, station_id: StationId) -> Result<i64, QuestlineError>;
    async fn create_visit(&self, new: NewVisit) -> Result<StationVisit, QuestlineError>;
    async fn update_visit(&self, visit: &StationVisit) -> Result<(), QuestlineError>;
    async fn finished_station_ids(&self, team_id: TeamId)
        -> Result<Vec<StationId>, QuestlineError>;

    // -- content and deliveries --
    async fn content_block(&self, id: ContentBlockId) -> Result<ContentBlock, QuestlineError>;
    async fn create_content_block(
        &self,
        new: NewContentBlock,
    ) -> Result<ContentBlock, QuestlineError>;
    /// Unique on (content_block_id, team_id, player_id); a conflict returns
    /// the existing delivery.
    async fn insert_delivery(
        &self,
        new: NewDelivery,
    ) -> Result<Inserted<Delivery>, QuestlineError>;
    async fn deliveries_for_player(
        &self,
        team_id: TeamId,
        player_id: PlayerId,
    ) -> Result<Vec<Delivery>, QuestlineError>;

    // -- dialogues --
    async fn thread_by_key(
        &self,
        event_id: EventId,
        key: &str,
    ) -> Result<DialogueThread, QuestlineError>;
    async fn create_thread(&self, new: NewThread) -> Result<DialogueThread, QuestlineError>;
    /// Messages of a thread in `order_index` order.
    async fn messages_by_thread(
        &self,
        thread_id: ThreadId,
    ) -> Result<Vec<DialogueMessage>, QuestlineError>;
    async fn create_message(&self, new: NewMessage) -> Result<DialogueMessage, QuestlineError>;

    // -- ratings --
    /// Unique on (visit_id, player_id); a repeat submit returns the existing
    /// rating.
    async fn insert_rating(&self, new: NewRating) -> Result<Inserted<Rating>, QuestlineError>;
}
