//! In-process state store. The default backend for a single coordinating
//! process per event, and the test double for everything above the port.
//!
//! All mutations take the write lock, so each method is atomic on its own.
//! Cross-method races (read capacity, then insert) are serialized by the
//! engine's keyed locks, same as for the Postgres backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use questline_common::{
    ContentBlockId, EventId, PlayerId, QuestlineError, StationId, TeamId, TeamState, ThreadId,
    VisitId, VisitState,
};

use crate::entities::*;
use crate::{Inserted, StateStore};

#[derive(Default)]
struct State {
    next_id: i64,
    events: HashMap<EventId, Event>,
    teams: HashMap<TeamId, Team>,
    players: HashMap<PlayerId, Player>,
    stations: HashMap<StationId, Station>,
    visits: HashMap<VisitId, StationVisit>,
    content_blocks: HashMap<ContentBlockId, ContentBlock>,
    deliveries: Vec<Delivery>,
    threads: HashMap<ThreadId, DialogueThread>,
    messages: HashMap<i64, DialogueMessage>,
    ratings: Vec<Rating>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(what: &str, id: i64) -> QuestlineError {
    QuestlineError::NotFound(format!("{what} {id}"))
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_event(&self, name: &str, slug: &str) -> Result<Event, QuestlineError> {
        let mut s = self.inner.write().await;
        let id = s.next_id();
        let event = Event {
            id,
            name: name.to_string(),
            slug: slug.to_string(),
            starts_at: None,
            ends_at: None,
            config: Value::Object(Default::default()),
            created_at: Utc::now(),
        };
        s.events.insert(id, event.clone());
        Ok(event)
    }

    async fn team(&self, id: TeamId) -> Result<Team, QuestlineError> {
        let s = self.inner.read().await;
        s.teams.get(&id).cloned().ok_or_else(|| not_found("team", id))
    }

    async fn teams_by_event(&self, event_id: EventId) -> Result<Vec<Team>, QuestlineError> {
        let s = self.inner.read().await;
        let mut teams: Vec<Team> =
            s.teams.values().filter(|t| t.event_id == event_id).cloned().collect();
        teams.sort_by_key(|t| t.id);
        Ok(teams)
    }

    async fn create_team(&self, new: NewTeam) -> Result<Team, QuestlineError> {
        let mut s = self.inner.write().await;
        if s.teams.values().any(|t| t.event_id == new.event_id && t.name == new.name) {
            return Err(QuestlineError::Storage(format!(
                "team name '{}' already exists in event {}",
                new.name, new.event_id
            )));
        }
        let id = s.next_id();
        let team = Team {
            id,
            event_id: new.event_id,
            name: new.name,
            status: "active".to_string(),
            score_total: 0.0,
            current_state: TeamState::FreeRoam,
            current_station_id: None,
            progress: Value::Object(Default::default()),
            scan_token: None,
            created_at: Utc::now(),
        };
        s.teams.insert(id, team.clone());
        Ok(team)
    }

    async fn update_team(&self, team: &Team) -> Result<(), QuestlineError> {
        let mut s = self.inner.write().await;
        let existing = s.teams.get(&team.id).ok_or_else(|| not_found("team", team.id))?;
        // Score changes only through add_score; a stale read here must not
        // undo a concurrent increment.
        let score_total = existing.score_total;
        s.teams.insert(team.id, Team { score_total, ..team.clone() });
        Ok(())
    }

    async fn add_score(&self, team_id: TeamId, delta: f64) -> Result<f64, QuestlineError> {
        let mut s = self.inner.write().await;
        let team = s.teams.get_mut(&team_id).ok_or_else(|| not_found("team", team_id))?;
        team.score_total += delta;
        Ok(team.score_total)
    }

    async fn set_scan_token(&self, team_id: TeamId, token: &str) -> Result<(), QuestlineError> {
        let mut s = self.inner.write().await;
        let team = s.teams.get_mut(&team_id).ok_or_else(|| not_found("team", team_id))?;
        team.scan_token = Some(token.to_string());
        Ok(())
    }

    async fn player(&self, id: PlayerId) -> Result<Player, QuestlineError> {
        let s = self.inner.read().await;
        s.players.get(&id).cloned().ok_or_else(|| not_found("player", id))
    }

    async fn players_by_team(&self, team_id: TeamId) -> Result<Vec<Player>, QuestlineError> {
        let s = self.inner.read().await;
        let mut players: Vec<Player> =
            s.players.values().filter(|p| p.team_id == Some(team_id)).cloned().collect();
        players.sort_by_key(|p| p.id);
        Ok(players)
    }

    async fn register_player(&self, new: NewPlayer) -> Result<Player, QuestlineError> {
        let mut s = self.inner.write().await;
        if s.players
            .values()
            .any(|p| p.event_id == new.event_id && p.external_id == new.external_id)
        {
            return Err(QuestlineError::AlreadyRegistered);
        }
        let id = s.next_id();
        let player = Player {
            id,
            event_id: new.event_id,
            external_id: new.external_id,
            team_id: new.team_id,
            role: new.role,
            progress: Value::Object(Default::default()),
            flags: Value::Object(Default::default()),
            created_at: Utc::now(),
        };
        s.players.insert(id, player.clone());
        Ok(player)
    }

    async fn update_player_flags(
        &self,
        player_id: PlayerId,
        flags: Value,
    ) -> Result<(), QuestlineError> {
        let mut s = self.inner.write().await;
        let player =
            s.players.get_mut(&player_id).ok_or_else(|| not_found("player", player_id))?;
        player.flags = flags;
        Ok(())
    }

    async fn station(&self, id: StationId) -> Result<Station, QuestlineError> {
        let s = self.inner.read().await;
        s.stations.get(&id).cloned().ok_or_else(|| not_found("station", id))
    }

    async fn create_station(&self, new: NewStation) -> Result<Station, QuestlineError> {
        let mut s = self.inner.write().await;
        let id = s.next_id();
        let station = Station {
            id,
            event_id: new.event_id,
            name: new.name,
            capacity: new.capacity,
            config: Value::Object(Default::default()),
            created_at: Utc::now(),
        };
        s.stations.insert(id, station.clone());
        Ok(station)
    }

    async fn visit(&self, id: VisitId) -> Result<StationVisit, QuestlineError> {
        let s = self.inner.read().await;
        s.visits.get(&id).cloned().ok_or_else(|| not_found("visit", id))
    }

    async fn active_visit(
        &self,
        team_id: TeamId,
        station_id: StationId,
    ) -> Result<Option<StationVisit>, QuestlineError> {
        let s = self.inner.read().await;
        Ok(s.visits
            .values()
            .find(|v| {
                v.team_id == team_id
                    && v.station_id == station_id
                    && v.state != VisitState::Finished
            })
            .cloned())
    }

    async fn active_visit_count(&self, station_id: StationId) -> Result<i64, QuestlineError> {
        let s = self.inner.read().await;
        Ok(s.visits
            .values()
            .filter(|v| v.station_id == station_id && v.state != VisitState::Finished)
            .count() as i64)
    }

    async fn create_visit(&self, new: NewVisit) -> Result<StationVisit, QuestlineError> {
        let mut s = self.inner.write().await;
        let id = s.next_id();
        let visit = StationVisit {
            id,
            event_id: new.event_id,
            team_id: new.team_id,
            station_id: new.station_id,
            state: new.state,
            started_at: None,
            ended_at: None,
            points_awarded: 0.0,
            host_notes: None,
            host_rating: None,
            created_at: Utc::now(),
        };
        s.visits.insert(id, visit.clone());
        Ok(visit)
    }

    async fn update_visit(&self, visit: &StationVisit) -> Result<(), QuestlineError> {
        let mut s = self.inner.write().await;
        if !s.visits.contains_key(&visit.id) {
            return Err(not_found("visit", visit.id));
        }
        s.visits.insert(visit.id, visit.clone());
        Ok(())
    }

    async fn finished_station_ids(
        &self,
        team_id: TeamId,
    ) -> Result<Vec<StationId>, QuestlineError> {
        let s = self.inner.read().await;
        let mut ids: Vec<StationId> = s
            .visits
            .values()
            .filter(|v| v.team_id == team_id && v.state == VisitState::Finished)
            .map(|v| v.station_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn content_block(&self, id: ContentBlockId) -> Result<ContentBlock, QuestlineError> {
        let s = self.inner.read().await;
        s.content_blocks.get(&id).cloned().ok_or_else(|| not_found("content block", id))
    }

    async fn create_content_block(
        &self,
        new: NewContentBlock,
    ) -> Result<ContentBlock, QuestlineError> {
        let mut s = self.inner.write().await;
        let id = s.next_id();
        let block = ContentBlock {
            id,
            event_id: new.event_id,
            key: new.key,
            kind: new.kind,
            payload: new.payload,
            audience: new.audience,
            station_id: new.station_id,
            version: 1,
            created_at: Utc::now(),
        };
        s.content_blocks.insert(id, block.clone());
        Ok(block)
    }

    async fn insert_delivery(
        &self,
        new: NewDelivery,
    ) -> Result<Inserted<Delivery>, QuestlineError> {
        let mut s = self.inner.write().await;
        if let Some(existing) = s.deliveries.iter().find(|d| {
            d.content_block_id == new.content_block_id
                && d.team_id == new.team_id
                && d.player_id == new.player_id
        }) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        let id = s.next_id();
        let delivery = Delivery {
            id,
            event_id: new.event_id,
            content_block_id: new.content_block_id,
            team_id: new.team_id,
            player_id: new.player_id,
            delivered_at: Utc::now(),
            seen_at: None,
        };
        s.deliveries.push(delivery.clone());
        Ok(Inserted::Created(delivery))
    }

    async fn deliveries_for_player(
        &self,
        team_id: TeamId,
        player_id: PlayerId,
    ) -> Result<Vec<Delivery>, QuestlineError> {
        let s = self.inner.read().await;
        Ok(s.deliveries
            .iter()
            .filter(|d| {
                d.team_id == team_id && (d.player_id.is_none() || d.player_id == Some(player_id))
            })
            .cloned()
            .collect())
    }

    async fn thread_by_key(
        &self,
        event_id: EventId,
        key: &str,
    ) -> Result<DialogueThread, QuestlineError> {
        let s = self.inner.read().await;
        s.threads
            .values()
            .find(|t| t.event_id == event_id && t.key == key)
            .cloned()
            .ok_or_else(|| QuestlineError::NotFound(format!("dialogue thread '{key}'")))
    }

    async fn create_thread(&self, new: NewThread) -> Result<DialogueThread, QuestlineError> {
        let mut s = self.inner.write().await;
        let id = s.next_id();
        let thread = DialogueThread {
            id,
            event_id: new.event_id,
            key: new.key,
            kind: new.kind,
            title: new.title,
            config: new.config,
            created_at: Utc::now(),
        };
        s.threads.insert(id, thread.clone());
        Ok(thread)
    }

    async fn messages_by_thread(
        &self,
        thread_id: ThreadId,
    ) -> Result<Vec<DialogueMessage>, QuestlineError> {
        let s = self.inner.read().await;
        let mut messages: Vec<DialogueMessage> =
            s.messages.values().filter(|m| m.thread_id == thread_id).cloned().collect();
        messages.sort_by_key(|m| (m.order_index, m.id));
        Ok(messages)
    }

    async fn create_message(&self, new: NewMessage) -> Result<DialogueMessage, QuestlineError> {
        let mut s = self.inner.write().await;
        let id = s.next_id();
        let message = DialogueMessage {
            id,
            event_id: new.event_id,
            thread_id: new.thread_id,
            content_block_id: new.content_block_id,
            audience: new.audience,
            payload: new.payload,
            order_index: new.order_index,
            gate_rules: new.gate_rules,
            flag_effects: new.flag_effects,
            created_at: Utc::now(),
        };
        s.messages.insert(id, message.clone());
        Ok(message)
    }

    async fn insert_rating(&self, new: NewRating) -> Result<Inserted<Rating>, QuestlineError> {
        let mut s = self.inner.write().await;
        if let Some(existing) = s
            .ratings
            .iter()
            .find(|r| r.visit_id == new.visit_id && r.player_id == new.player_id)
        {
            return Ok(Inserted::Existing(existing.clone()));
        }
        let id = s.next_id();
        let rating = Rating {
            id,
            event_id: new.event_id,
            visit_id: new.visit_id,
            player_id: new.player_id,
            station_rating: new.station_rating,
            host_rating: new.host_rating,
            comment: new.comment,
            created_at: Utc::now(),
        };
        s.ratings.push(rating.clone());
        Ok(Inserted::Created(rating))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_key_is_unique_and_null_player_is_its_own_key() {
        let store = MemoryStore::new();
        let new = NewDelivery { event_id: 1, content_block_id: 10, team_id: 2, player_id: None };

        let first = store.insert_delivery(new.clone()).await.unwrap();
        assert!(first.is_created());

        let second = store.insert_delivery(new.clone()).await.unwrap();
        assert!(!second.is_created());
        assert_eq!(second.record().id, first.record().id);

        // Same block, same team, but player-specific: a distinct key.
        let player_specific =
            store.insert_delivery(NewDelivery { player_id: Some(7), ..new }).await.unwrap();
        assert!(player_specific.is_created());
    }

    #[tokio::test]
    async fn score_increments_accumulate() {
        let store = MemoryStore::new();
        let event = store.create_event("ev", "ev").await.unwrap();
        let team =
            store.create_team(NewTeam { event_id: event.id, name: "t1".into() }).await.unwrap();

        assert_eq!(store.add_score(team.id, 50.0).await.unwrap(), 50.0);
        assert_eq!(store.add_score(team.id, 25.5).await.unwrap(), 75.5);
        assert_eq!(store.team(team.id).await.unwrap().score_total, 75.5);
    }

    #[tokio::test]
    async fn reregistration_is_rejected() {
        let store = MemoryStore::new();
        let event = store.create_event("ev", "ev").await.unwrap();
        let new = NewPlayer {
            event_id: event.id,
            external_id: "ext-1".into(),
            team_id: None,
            role: None,
        };
        store.register_player(new.clone()).await.unwrap();
        let err = store.register_player(new).await.unwrap_err();
        assert!(matches!(err, QuestlineError::AlreadyRegistered));
    }

    #[tokio::test]
    async fn rating_is_written_once_per_visit_and_player() {
        let store = MemoryStore::new();
        let new = NewRating {
            event_id: 1,
            visit_id: 5,
            player_id: 9,
            station_rating: 4,
            host_rating: 5,
            comment: None,
        };
        assert!(store.insert_rating(new.clone()).await.unwrap().is_created());
        assert!(!store.insert_rating(new).await.unwrap().is_created());
    }
}
