//! Orchestration facade.
//!
//! Every mutating operation follows the same shape: check scope, take the
//! keyed locks, load through the store, apply a pure transition, persist,
//! append one audit entry, publish envelopes. Business-rule failures come
//! back as typed errors to the immediate caller; nothing is thrown across
//! the hub. A store failure aborts the single request — the transition is
//! not considered applied and the engine does not retry.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use questline_common::{
    Channel, ContentBlockId, Envelope, EventId, PlayerId, QuestlineError, Scope, StationId,
    TeamId, UserRole, VisitId, VisitState,
};
use questline_events::{AppendEntry, AuditLog, LogEntry};
use questline_hub::Hub;
use questline_store::{
    Delivery, DialogueMessage, Inserted, NewDelivery, NewPlayer, NewRating, NewVisit, Player,
    Rating, StateStore, StationVisit, Team,
};

use crate::delivery::{resolve_pairs, AudienceTarget};
use crate::dialogue;
use crate::identity::{constant_time_eq, ScanTokenSigner};
use crate::locks::KeyedLocks;
use crate::{team, visit};

pub struct Engine {
    store: Arc<dyn StateStore>,
    log: Arc<dyn AuditLog>,
    hub: Hub,
    scan_tokens: ScanTokenSigner,
    // Lock order at every call site: team, then station, then visit pair.
    team_locks: KeyedLocks<TeamId>,
    station_locks: KeyedLocks<StationId>,
    visit_locks: KeyedLocks<(TeamId, StationId)>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn StateStore>,
        log: Arc<dyn AuditLog>,
        hub: Hub,
        scan_tokens: ScanTokenSigner,
    ) -> Self {
        Self {
            store,
            log,
            hub,
            scan_tokens,
            team_locks: KeyedLocks::new(),
            station_locks: KeyedLocks::new(),
            visit_locks: KeyedLocks::new(),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    // --- Team movement (organizer) ---

    /// Send a team toward a station.
    pub async fn assign_team(
        &self,
        scope: &Scope,
        team_id: TeamId,
        station_id: StationId,
    ) -> Result<Team, QuestlineError> {
        require_role(scope, UserRole::Admin)?;
        let _guard = self.team_locks.acquire(team_id).await;

        let team = self.load_team(scope, team_id).await?;
        let station = self.store.station(station_id).await?;
        ensure_event(scope, station.event_id, "station", station_id)?;

        let (updated, envelope) = team::assign(&team, station_id)?;
        self.store.update_team(&updated).await?;

        self.record(
            AppendEntry::new(
                scope.event_id,
                "team_assigned",
                json!({"team_id": team_id, "station_id": station_id}),
            )
            .with_team(team_id),
        )
        .await;
        self.publish_team_state(&updated, envelope).await;

        info!(team_id, station_id, "team assigned");
        Ok(updated)
    }

    /// Recall an assigned team back to free roam.
    pub async fn recall_team(
        &self,
        scope: &Scope,
        team_id: TeamId,
    ) -> Result<Team, QuestlineError> {
        require_role(scope, UserRole::Admin)?;
        let _guard = self.team_locks.acquire(team_id).await;

        let team = self.load_team(scope, team_id).await?;
        let (updated, envelope) = team::recall(&team)?;
        self.store.update_team(&updated).await?;

        self.record(
            AppendEntry::new(scope.event_id, "team_recalled", json!({"team_id": team_id}))
                .with_team(team_id),
        )
        .await;
        self.publish_team_state(&updated, envelope).await;

        info!(team_id, "team recalled");
        Ok(updated)
    }

    // --- Visit lifecycle (station host) ---

    /// A host scanned a team's code at a station. Verifies the token,
    /// enforces capacity, creates the visit in `arrived` and moves the team
    /// to `in_visit`. A re-scan while the visit is open returns the existing
    /// visit rather than consuming more capacity.
    pub async fn arrive(
        &self,
        scope: &Scope,
        token: &str,
        station_id: StationId,
    ) -> Result<StationVisit, QuestlineError> {
        require_role(scope, UserRole::StationHost)?;

        let station = self.store.station(station_id).await?;
        ensure_event(scope, station.event_id, "station", station_id)?;

        let (token_event, team_id) = self.scan_tokens.verify(token)?;
        if token_event != scope.event_id {
            warn!(token_event, team_id, "scan token from another event");
            return Err(QuestlineError::InvalidToken);
        }

        let _team_guard = self.team_locks.acquire(team_id).await;
        let _station_guard = self.station_locks.acquire(station_id).await;

        let team = self.load_team(scope, team_id).await?;
        match team.scan_token.as_deref() {
            Some(stored) if constant_time_eq(stored.as_bytes(), token.as_bytes()) => {}
            _ => return Err(QuestlineError::InvalidToken),
        }

        if let Some(existing) = self.store.active_visit(team_id, station_id).await? {
            return Ok(existing);
        }

        let active = self.store.active_visit_count(station_id).await?;
        if active >= station.capacity as i64 {
            return Err(QuestlineError::CapacityExceeded);
        }

        let (updated_team, envelope) = team::enter_visit(&team, station_id)?;
        let visit = self
            .store
            .create_visit(NewVisit {
                event_id: scope.event_id,
                team_id,
                station_id,
                state: VisitState::Arrived,
            })
            .await?;
        self.store.update_team(&updated_team).await?;

        self.record(
            AppendEntry::new(
                scope.event_id,
                "team_arrived",
                json!({"visit_id": visit.id, "team_id": team_id, "station_id": station_id}),
            )
            .with_team(team_id),
        )
        .await;
        self.publish_team_state(&updated_team, envelope).await;
        self.hub
            .publish(Channel::Admin(scope.event_id), &Envelope::AdminVisitUpdate {
                visit_id: visit.id,
            })
            .await;

        info!(team_id, station_id, visit_id = visit.id, "team arrived");
        Ok(visit)
    }

    /// Validate a scanned team token at a station and return the team with
    /// its open visit there, if any. Read-only: the host UI calls this to
    /// show the team before starting anything.
    pub async fn scan(
        &self,
        scope: &Scope,
        token: &str,
        station_id: StationId,
    ) -> Result<(Team, Option<StationVisit>), QuestlineError> {
        require_role(scope, UserRole::StationHost)?;

        let station = self.store.station(station_id).await?;
        ensure_event(scope, station.event_id, "station", station_id)?;

        let (token_event, team_id) = self.scan_tokens.verify(token)?;
        if token_event != scope.event_id {
            return Err(QuestlineError::InvalidToken);
        }

        let team = self.load_team(scope, team_id).await?;
        match team.scan_token.as_deref() {
            Some(stored) if constant_time_eq(stored.as_bytes(), token.as_bytes()) => {}
            _ => return Err(QuestlineError::InvalidToken),
        }

        let active = self.store.active_visit(team_id, station_id).await?;
        Ok((team, active))
    }

    /// Begin the visit. Idempotent: a retry returns the already-started
    /// record and publishes nothing.
    pub async fn start_visit(
        &self,
        scope: &Scope,
        visit_id: VisitId,
    ) -> Result<StationVisit, QuestlineError> {
        require_role(scope, UserRole::StationHost)?;

        let probe = self.store.visit(visit_id).await?;
        ensure_event(scope, probe.event_id, "visit", visit_id)?;

        let _team_guard = self.team_locks.acquire(probe.team_id).await;
        let _visit_guard = self.visit_locks.acquire((probe.team_id, probe.station_id)).await;

        let current = self.store.visit(visit_id).await?;
        match visit::start(&current, Utc::now())? {
            visit::StartOutcome::AlreadyStarted(existing) => Ok(existing),
            visit::StartOutcome::Started(updated, envelope) => {
                self.store.update_visit(&updated).await?;

                self.record(
                    AppendEntry::new(
                        scope.event_id,
                        "visit_started",
                        json!({"visit_id": visit_id, "team_id": updated.team_id}),
                    )
                    .with_team(updated.team_id),
                )
                .await;
                self.hub
                    .publish_all(
                        &[Channel::Team(updated.team_id), Channel::Station(updated.station_id)],
                        &envelope,
                    )
                    .await;
                self.hub
                    .publish(Channel::Admin(scope.event_id), &Envelope::AdminVisitUpdate {
                        visit_id,
                    })
                    .await;

                info!(visit_id, team_id = updated.team_id, "visit started");
                Ok(updated)
            }
        }
    }

    /// Close the visit, award points and release the team. Not idempotent:
    /// a second call fails with `AlreadyFinished` so points cannot be
    /// double-awarded.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_visit(
        &self,
        scope: &Scope,
        visit_id: VisitId,
        points: f64,
        host_notes: Option<String>,
        host_rating: Option<i32>,
        event_complete: bool,
    ) -> Result<StationVisit, QuestlineError> {
        require_role(scope, UserRole::StationHost)?;

        let probe = self.store.visit(visit_id).await?;
        ensure_event(scope, probe.event_id, "visit", visit_id)?;

        let _team_guard = self.team_locks.acquire(probe.team_id).await;
        let _visit_guard = self.visit_locks.acquire((probe.team_id, probe.station_id)).await;

        let current = self.store.visit(visit_id).await?;
        let (updated_visit, visit_envelope) =
            visit::finish(&current, points, host_notes, host_rating, Utc::now())?;
        self.store.update_visit(&updated_visit).await?;

        // Score is an atomic increment at the store, in the same guarded
        // section as the finish transition: concurrent finishes on other
        // stations for the same team cannot lose updates.
        let new_total = self.store.add_score(updated_visit.team_id, points).await?;

        let team = self.load_team(scope, updated_visit.team_id).await?;
        let (mut updated_team, team_envelope) = team::exit_visit(&team, event_complete)?;
        updated_team.score_total = new_total;
        self.store.update_team(&updated_team).await?;

        self.record(
            AppendEntry::new(
                scope.event_id,
                "visit_finished",
                json!({
                    "visit_id": visit_id,
                    "team_id": updated_visit.team_id,
                    "points": points,
                }),
            )
            .with_team(updated_visit.team_id),
        )
        .await;
        self.hub
            .publish_all(
                &[
                    Channel::Team(updated_visit.team_id),
                    Channel::Station(updated_visit.station_id),
                ],
                &visit_envelope,
            )
            .await;
        self.publish_team_state(&updated_team, team_envelope).await;
        self.hub
            .publish(Channel::Admin(scope.event_id), &Envelope::AdminVisitUpdate { visit_id })
            .await;

        info!(visit_id, team_id = updated_visit.team_id, points, "visit finished");
        Ok(updated_visit)
    }

    // --- Content delivery ---

    /// Resolve the target to concrete (team, player?) pairs and deliver the
    /// block to each. Per pair: one unique-constraint insert; a conflict is
    /// "already delivered" and emits no second envelope. A scheduler firing
    /// a deferred delivery calls exactly this.
    pub async fn deliver_now(
        &self,
        scope: &Scope,
        content_block_id: ContentBlockId,
        target: AudienceTarget,
    ) -> Result<Vec<Inserted<Delivery>>, QuestlineError> {
        require_role(scope, UserRole::Admin)?;

        let block = self.store.content_block(content_block_id).await?;
        ensure_event(scope, block.event_id, "content block", content_block_id)?;

        let pairs: Vec<(TeamId, Option<PlayerId>)> = match &target {
            AudienceTarget::Player { player_id } => {
                let player = self.store.player(*player_id).await?;
                ensure_event(scope, player.event_id, "player", *player_id)?;
                let team_id = player.team_id.ok_or_else(|| {
                    QuestlineError::InvalidTransition(format!(
                        "player {player_id} has no team"
                    ))
                })?;
                vec![(team_id, Some(*player_id))]
            }
            AudienceTarget::AllTeams => {
                let teams = self.store.teams_by_event(scope.event_id).await?;
                let players = self.players_of(&teams).await?;
                resolve_pairs(block.audience, &teams, &players)?
            }
            AudienceTarget::Teams { team_ids } => {
                let mut teams = Vec::with_capacity(team_ids.len());
                for id in team_ids {
                    teams.push(self.load_team(scope, *id).await?);
                }
                let players = self.players_of(&teams).await?;
                resolve_pairs(block.audience, &teams, &players)?
            }
        };

        let mut results = Vec::with_capacity(pairs.len());
        for (team_id, player_id) in pairs {
            let outcome = self
                .deliver_pair(scope.event_id, content_block_id, team_id, player_id)
                .await?;
            results.push(outcome);
        }
        Ok(results)
    }

    /// One pair, one idempotent insert, at most one envelope.
    async fn deliver_pair(
        &self,
        event_id: EventId,
        content_block_id: ContentBlockId,
        team_id: TeamId,
        player_id: Option<PlayerId>,
    ) -> Result<Inserted<Delivery>, QuestlineError> {
        let outcome = self
            .store
            .insert_delivery(NewDelivery { event_id, content_block_id, team_id, player_id })
            .await?;

        if outcome.is_created() {
            let mut entry = AppendEntry::new(
                event_id,
                "content_delivered",
                json!({
                    "content_block_id": content_block_id,
                    "team_id": team_id,
                    "player_id": player_id,
                }),
            )
            .with_team(team_id);
            if let Some(player_id) = player_id {
                entry = entry.with_player(player_id);
            }
            self.record(entry).await;

            self.hub
                .publish(
                    Channel::Team(team_id),
                    &Envelope::ContentDelivered { team_id, player_id, content_block_id },
                )
                .await;
        }
        Ok(outcome)
    }

    // --- Dialogues ---

    /// Handle an interactive dialogue reply: gate-match the candidate
    /// messages, apply the selected message's flag effects, and deliver it
    /// through the delivery engine so retries stay idempotent.
    pub async fn dialogue_reply(
        &self,
        scope: &Scope,
        thread_key: &str,
        reply: &str,
    ) -> Result<Option<DialogueMessage>, QuestlineError> {
        require_role(scope, UserRole::Player)?;
        let player_id = scope
            .player_id
            .ok_or_else(|| QuestlineError::ScopeViolation("session has no player".into()))?;
        let team_id = scope
            .team_id
            .ok_or_else(|| QuestlineError::ScopeViolation("session has no team".into()))?;

        let thread = self.store.thread_by_key(scope.event_id, thread_key).await?;
        if thread.kind != questline_common::DialogueKind::Interactive {
            return Err(QuestlineError::InvalidTransition(format!(
                "thread '{thread_key}' is not interactive"
            )));
        }

        let player = self.store.player(player_id).await?;
        let messages = self.store.messages_by_thread(thread.id).await?;
        let fallback = dialogue::fallback_message_id(&thread.config);

        let Some(selected) =
            dialogue::select_response(&messages, player.role, reply, &player.flags, fallback)
        else {
            self.record(
                AppendEntry::new(
                    scope.event_id,
                    "dialogue_reply",
                    json!({"thread_id": thread.id, "matched": false}),
                )
                .with_team(team_id)
                .with_player(player_id),
            )
            .await;
            return Ok(None);
        };
        let selected = selected.clone();

        if selected.flag_effects.is_some() {
            let merged =
                dialogue::apply_flag_effects(&player.flags, selected.flag_effects.as_ref());
            self.store.update_player_flags(player_id, merged).await?;
        }

        self.deliver_pair(scope.event_id, selected.content_block_id, team_id, Some(player_id))
            .await?;

        self.record(
            AppendEntry::new(
                scope.event_id,
                "dialogue_reply",
                json!({
                    "thread_id": thread.id,
                    "matched": true,
                    "message_id": selected.id,
                }),
            )
            .with_team(team_id)
            .with_player(player_id),
        )
        .await;

        Ok(Some(selected))
    }

    /// Leaked-thread view: every message whose audience matches the player,
    /// in order, once its content block has been delivered.
    pub async fn leaked_messages(
        &self,
        scope: &Scope,
        thread_key: &str,
    ) -> Result<Vec<DialogueMessage>, QuestlineError> {
        require_role(scope, UserRole::Player)?;
        let player_id = scope
            .player_id
            .ok_or_else(|| QuestlineError::ScopeViolation("session has no player".into()))?;
        let team_id = scope
            .team_id
            .ok_or_else(|| QuestlineError::ScopeViolation("session has no team".into()))?;

        let thread = self.store.thread_by_key(scope.event_id, thread_key).await?;
        if thread.kind != questline_common::DialogueKind::Leaked {
            return Err(QuestlineError::InvalidTransition(format!(
                "thread '{thread_key}' is not leaked"
            )));
        }

        let player = self.store.player(player_id).await?;
        let messages = self.store.messages_by_thread(thread.id).await?;
        let delivered: Vec<i64> = self
            .store
            .deliveries_for_player(team_id, player_id)
            .await?
            .into_iter()
            .map(|d| d.content_block_id)
            .collect();

        Ok(dialogue::visible_leaked(&messages, player.role, &delivered)
            .into_iter()
            .cloned()
            .collect())
    }

    // --- Ratings ---

    /// One rating per (visit, player); a repeat submit returns the original.
    pub async fn submit_rating(
        &self,
        scope: &Scope,
        visit_id: VisitId,
        station_rating: i32,
        host_rating: i32,
        comment: Option<String>,
    ) -> Result<Inserted<Rating>, QuestlineError> {
        require_role(scope, UserRole::Player)?;
        let player_id = scope
            .player_id
            .ok_or_else(|| QuestlineError::ScopeViolation("session has no player".into()))?;

        let visit = self.store.visit(visit_id).await?;
        ensure_event(scope, visit.event_id, "visit", visit_id)?;
        if scope.team_id != Some(visit.team_id) {
            return Err(QuestlineError::ScopeViolation(
                "cannot rate another team's visit".into(),
            ));
        }
        if visit.state != VisitState::Finished {
            return Err(QuestlineError::InvalidTransition(format!(
                "visit {visit_id} is not finished"
            )));
        }

        let outcome = self
            .store
            .insert_rating(NewRating {
                event_id: scope.event_id,
                visit_id,
                player_id,
                station_rating,
                host_rating,
                comment,
            })
            .await?;

        if outcome.is_created() {
            self.record(
                AppendEntry::new(
                    scope.event_id,
                    "rating_submitted",
                    json!({"visit_id": visit_id, "station_rating": station_rating}),
                )
                .with_team(visit.team_id)
                .with_player(player_id),
            )
            .await;
        }
        Ok(outcome)
    }

    // --- Onboarding and tokens (organizer) ---

    /// Register a player's verified external identity. Re-registration is
    /// rejected, not duplicated.
    pub async fn register_player(
        &self,
        scope: &Scope,
        new: NewPlayer,
    ) -> Result<Player, QuestlineError> {
        require_role(scope, UserRole::Admin)?;
        if new.event_id != scope.event_id {
            return Err(QuestlineError::ScopeViolation(
                "cannot register a player into another event".into(),
            ));
        }

        let player = self.store.register_player(new).await?;
        self.record(
            AppendEntry::new(
                scope.event_id,
                "player_registered",
                json!({"player_id": player.id, "team_id": player.team_id}),
            )
            .with_player(player.id),
        )
        .await;
        Ok(player)
    }

    /// Issue (and store) a fresh scan token for a team's QR code. The token
    /// itself never goes to the audit log.
    pub async fn issue_scan_token(
        &self,
        scope: &Scope,
        team_id: TeamId,
    ) -> Result<String, QuestlineError> {
        require_role(scope, UserRole::Admin)?;
        let team = self.load_team(scope, team_id).await?;

        let token = self.scan_tokens.issue(scope.event_id, team.id);
        self.store.set_scan_token(team.id, &token).await?;
        self.record(
            AppendEntry::new(scope.event_id, "scan_token_issued", json!({"team_id": team_id}))
                .with_team(team_id),
        )
        .await;
        Ok(token)
    }

    // --- Audit stream ---

    /// Ordered, append-only audit read for organizers. `entry_type` wins if
    /// both filters are given.
    pub async fn read_log(
        &self,
        scope: &Scope,
        seq_start: i64,
        limit: usize,
        team_id: Option<TeamId>,
        entry_type: Option<&str>,
    ) -> Result<Vec<LogEntry>, QuestlineError> {
        require_role(scope, UserRole::Admin)?;
        match (entry_type, team_id) {
            (Some(t), _) => self.log.read_by_type(scope.event_id, t, seq_start, limit).await,
            (None, Some(team)) => {
                self.log.read_by_team(scope.event_id, team, seq_start, limit).await
            }
            (None, None) => self.log.read_from(scope.event_id, seq_start, limit).await,
        }
    }

    // --- Internals ---

    async fn load_team(&self, scope: &Scope, team_id: TeamId) -> Result<Team, QuestlineError> {
        let team = self.store.team(team_id).await?;
        ensure_event(scope, team.event_id, "team", team_id)?;
        Ok(team)
    }

    async fn players_of(&self, teams: &[Team]) -> Result<Vec<Player>, QuestlineError> {
        let mut players = Vec::new();
        for team in teams {
            players.extend(self.store.players_by_team(team.id).await?);
        }
        Ok(players)
    }

    /// Append one audit entry and mirror it to the admin channel. A failed
    /// append is logged and swallowed: the audit trail is a sink, and its
    /// unavailability must not roll back a committed transition.
    async fn record(&self, entry: AppendEntry) {
        let event_id = entry.event_id;
        match self.log.append(entry).await {
            Ok(stored) => {
                let row = serde_json::to_value(&stored).unwrap_or_default();
                self.hub
                    .publish(Channel::Admin(event_id), &Envelope::AdminLogEntry { entry: row })
                    .await;
            }
            Err(e) => warn!(error = %e, "audit append failed"),
        }
    }

    /// Fan a team's new state to its own channel and the event feed, and the
    /// full record to the admin channel.
    async fn publish_team_state(&self, team: &Team, envelope: Envelope) {
        debug_assert!(team::station_invariant_holds(team));
        self.hub
            .publish_all(&[Channel::Team(team.id), Channel::Event(team.event_id)], &envelope)
            .await;
        self.hub
            .publish(
                Channel::Admin(team.event_id),
                &Envelope::AdminTeamUpdate {
                    team_id: team.id,
                    team: serde_json::to_value(team).unwrap_or_default(),
                },
            )
            .await;
    }
}

fn require_role(scope: &Scope, role: UserRole) -> Result<(), QuestlineError> {
    if scope.role != role {
        return Err(QuestlineError::ScopeViolation(format!(
            "{} required, session is {}",
            role, scope.role
        )));
    }
    Ok(())
}

/// Entities from another event read as missing rather than forbidden, so a
/// scoped caller cannot probe for ids outside its event.
fn ensure_event(
    scope: &Scope,
    entity_event: EventId,
    what: &str,
    id: i64,
) -> Result<(), QuestlineError> {
    if scope.event_id != entity_event {
        return Err(QuestlineError::NotFound(format!("{what} {id}")));
    }
    Ok(())
}
