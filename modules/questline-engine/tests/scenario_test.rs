//! End-to-end walks through the engine against the in-memory store:
//! assignment, arrival, visit lifecycle, delivery idempotency, capacity
//! under racing arrivals, and channel isolation.

use std::sync::Arc;

use serde_json::json;

use questline_common::{
    Audience, Channel, DialogueKind, Envelope, PlayerRole, QuestlineError, Scope, TeamState,
    VisitState,
};
use questline_engine::{AudienceTarget, Engine, ScanTokenSigner};
use questline_events::{AuditLog, MemoryAuditLog};
use questline_hub::Hub;
use questline_store::{
    MemoryStore, NewContentBlock, NewMessage, NewPlayer, NewStation, NewTeam, NewThread,
    StateStore, Station, Team,
};

struct Ctx {
    engine: Engine,
    store: Arc<MemoryStore>,
    log: Arc<MemoryAuditLog>,
    hub: Hub,
    event_id: i64,
    admin: Scope,
}

async fn setup() -> Ctx {
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(MemoryAuditLog::new());
    let hub = Hub::new();
    let engine = Engine::new(
        store.clone(),
        log.clone(),
        hub.clone(),
        ScanTokenSigner::new("test-secret"),
    );

    let event = store.create_event("Night Quest", "night-quest").await.unwrap();
    let admin = Scope::admin(event.id);

    Ctx { engine, store, log, hub, event_id: event.id, admin }
}

impl Ctx {
    async fn team(&self, name: &str) -> Team {
        self.store
            .create_team(NewTeam { event_id: self.event_id, name: name.into() })
            .await
            .unwrap()
    }

    async fn station(&self, name: &str, capacity: i32) -> Station {
        self.store
            .create_station(NewStation { event_id: self.event_id, name: name.into(), capacity })
            .await
            .unwrap()
    }
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(env) = rx.try_recv() {
        out.push(env);
    }
    out
}

#[tokio::test]
async fn full_station_run_scenario() {
    let ctx = setup().await;
    let team = ctx.team("T1").await;
    let station = ctx.station("StationA", 1).await;
    let host = Scope::host(ctx.event_id, station.id);

    // Live observers.
    let (team_conn, mut team_rx) = ctx.hub.register(Scope::player(ctx.event_id, team.id, 0)).await;
    ctx.hub.subscribe(team_conn, Channel::Team(team.id)).await.unwrap();
    let (event_conn, mut event_rx) =
        ctx.hub.register(Scope::player(ctx.event_id, team.id, 0)).await;
    ctx.hub.subscribe(event_conn, Channel::Event(ctx.event_id)).await.unwrap();

    // assign: free_roam -> assigned, envelope on team and event channels.
    let assigned = ctx.engine.assign_team(&ctx.admin, team.id, station.id).await.unwrap();
    assert_eq!(assigned.current_state, TeamState::Assigned);
    assert_eq!(assigned.current_station_id, Some(station.id));

    let team_envs = drain(&mut team_rx);
    assert!(team_envs.iter().any(|e| matches!(
        e,
        Envelope::TeamStateChanged { state: TeamState::Assigned, station_id, .. }
            if *station_id == Some(station.id)
    )));
    assert!(drain(&mut event_rx).iter().any(|e| e.kind() == "team:state"));

    // arrive with a valid token: visit arrived, team in_visit.
    let token = ctx.engine.issue_scan_token(&ctx.admin, team.id).await.unwrap();
    let visit = ctx.engine.arrive(&host, &token, station.id).await.unwrap();
    assert_eq!(visit.state, VisitState::Arrived);
    assert_eq!(
        ctx.store.team(team.id).await.unwrap().current_state,
        TeamState::InVisit
    );
    drain(&mut team_rx);

    // start twice: single started state, one visit:started envelope.
    let started = ctx.engine.start_visit(&host, visit.id).await.unwrap();
    assert_eq!(started.state, VisitState::Started);
    let again = ctx.engine.start_visit(&host, visit.id).await.unwrap();
    assert_eq!(again.id, started.id);
    assert_eq!(again.started_at, started.started_at);

    let started_envs: Vec<_> = drain(&mut team_rx)
        .into_iter()
        .filter(|e| e.kind() == "visit:started")
        .collect();
    assert_eq!(started_envs.len(), 1);

    // finish: points awarded once, team back to free_roam.
    let finished = ctx
        .engine
        .finish_visit(&host, visit.id, 50.0, Some("good run".into()), Some(5), false)
        .await
        .unwrap();
    assert_eq!(finished.state, VisitState::Finished);
    assert_eq!(finished.points_awarded, 50.0);

    let after = ctx.store.team(team.id).await.unwrap();
    assert_eq!(after.score_total, 50.0);
    assert_eq!(after.current_state, TeamState::FreeRoam);
    assert_eq!(after.current_station_id, None);

    let finish_envs = drain(&mut team_rx);
    assert!(finish_envs.iter().any(|e| matches!(
        e,
        Envelope::VisitFinished { points, .. } if *points == 50.0
    )));
    assert!(finish_envs.iter().any(|e| matches!(
        e,
        Envelope::TeamStateChanged { state: TeamState::FreeRoam, .. }
    )));

    // Second finish: AlreadyFinished, score unchanged.
    let err = ctx.engine.finish_visit(&host, visit.id, 50.0, None, None, false).await.unwrap_err();
    assert!(matches!(err, QuestlineError::AlreadyFinished));
    assert_eq!(ctx.store.team(team.id).await.unwrap().score_total, 50.0);

    // The audit trail recorded each accepted mutation exactly once.
    let kinds: Vec<String> = ctx
        .log
        .read_from(ctx.event_id, 1, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.entry_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            "team_assigned",
            "scan_token_issued",
            "team_arrived",
            "visit_started",
            "visit_finished",
        ]
    );
}

#[tokio::test]
async fn scan_at_wrong_station_is_a_station_mismatch() {
    let ctx = setup().await;
    let team = ctx.team("T1").await;
    let station_a = ctx.station("A", 1).await;
    let station_b = ctx.station("B", 1).await;

    ctx.engine.assign_team(&ctx.admin, team.id, station_a.id).await.unwrap();
    let token = ctx.engine.issue_scan_token(&ctx.admin, team.id).await.unwrap();

    let host_b = Scope::host(ctx.event_id, station_b.id);
    let err = ctx.engine.arrive(&host_b, &token, station_b.id).await.unwrap_err();
    assert!(matches!(err, QuestlineError::StationMismatch { .. }));
}

#[tokio::test]
async fn arrive_rejects_bad_and_stale_tokens() {
    let ctx = setup().await;
    let team = ctx.team("T1").await;
    let station = ctx.station("A", 1).await;
    let host = Scope::host(ctx.event_id, station.id);

    ctx.engine.assign_team(&ctx.admin, team.id, station.id).await.unwrap();

    // Never issued.
    let forged = ScanTokenSigner::new("other-secret").issue(ctx.event_id, team.id);
    assert!(matches!(
        ctx.engine.arrive(&host, &forged, station.id).await.unwrap_err(),
        QuestlineError::InvalidToken
    ));

    // Issued, then rotated: the old token no longer matches the stored one.
    let old = ctx.engine.issue_scan_token(&ctx.admin, team.id).await.unwrap();
    let _new = ctx.engine.issue_scan_token(&ctx.admin, team.id).await.unwrap();
    assert!(matches!(
        ctx.engine.arrive(&host, &old, station.id).await.unwrap_err(),
        QuestlineError::InvalidToken
    ));
}

#[tokio::test]
async fn capacity_holds_under_concurrent_arrivals() {
    let ctx = setup().await;
    let station = ctx.station("Bottleneck", 1).await;
    let host = Scope::host(ctx.event_id, station.id);

    let t1 = ctx.team("T1").await;
    let t2 = ctx.team("T2").await;
    ctx.engine.assign_team(&ctx.admin, t1.id, station.id).await.unwrap();
    ctx.engine.assign_team(&ctx.admin, t2.id, station.id).await.unwrap();
    let token1 = ctx.engine.issue_scan_token(&ctx.admin, t1.id).await.unwrap();
    let token2 = ctx.engine.issue_scan_token(&ctx.admin, t2.id).await.unwrap();

    let (r1, r2) = tokio::join!(
        ctx.engine.arrive(&host, &token1, station.id),
        ctx.engine.arrive(&host, &token2, station.id),
    );

    let oks = [r1.is_ok(), r2.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(oks, 1, "exactly one arrival may claim the last slot");
    let rejected = if r1.is_err() { r1.unwrap_err() } else { r2.unwrap_err() };
    assert!(matches!(rejected, QuestlineError::CapacityExceeded));

    assert_eq!(ctx.store.active_visit_count(station.id).await.unwrap(), 1);
}

#[tokio::test]
async fn rescan_returns_the_open_visit_without_consuming_capacity() {
    let ctx = setup().await;
    let station = ctx.station("A", 1).await;
    let host = Scope::host(ctx.event_id, station.id);
    let team = ctx.team("T1").await;

    ctx.engine.assign_team(&ctx.admin, team.id, station.id).await.unwrap();
    let token = ctx.engine.issue_scan_token(&ctx.admin, team.id).await.unwrap();

    let first = ctx.engine.arrive(&host, &token, station.id).await.unwrap();
    let second = ctx.engine.arrive(&host, &token, station.id).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(ctx.store.active_visit_count(station.id).await.unwrap(), 1);
}

#[tokio::test]
async fn team_delivery_race_produces_one_row_and_one_envelope() {
    let ctx = setup().await;
    let team = ctx.team("T2").await;

    let block = ctx
        .store
        .create_content_block(NewContentBlock {
            event_id: ctx.event_id,
            key: "briefing-1".into(),
            kind: "text".into(),
            payload: json!({"text": "meet at the fountain"}),
            audience: Audience::Team,
            station_id: None,
        })
        .await
        .unwrap();

    let (conn, mut rx) = ctx.hub.register(Scope::player(ctx.event_id, team.id, 0)).await;
    ctx.hub.subscribe(conn, Channel::Team(team.id)).await.unwrap();

    let target = AudienceTarget::Teams { team_ids: vec![team.id] };
    let (a, b) = tokio::join!(
        ctx.engine.deliver_now(&ctx.admin, block.id, target.clone()),
        ctx.engine.deliver_now(&ctx.admin, block.id, target.clone()),
    );

    let created: usize = [a.unwrap(), b.unwrap()]
        .iter()
        .flatten()
        .filter(|o| o.is_created())
        .count();
    assert_eq!(created, 1, "exactly one delivery row for the (block, team, null) key");

    let envs = drain(&mut rx);
    let delivered: Vec<_> = envs.iter().filter(|e| e.kind() == "content:delivered").collect();
    assert_eq!(delivered.len(), 1, "one envelope per effective delivery");
}

#[tokio::test]
async fn role_audience_reaches_only_matching_players() {
    let ctx = setup().await;
    let team = ctx.team("T1").await;

    let seeker = ctx
        .store
        .register_player(NewPlayer {
            event_id: ctx.event_id,
            external_id: "ext-seeker".into(),
            team_id: Some(team.id),
            role: Some(PlayerRole::Seeker),
        })
        .await
        .unwrap();
    let _keeper = ctx
        .store
        .register_player(NewPlayer {
            event_id: ctx.event_id,
            external_id: "ext-keeper".into(),
            team_id: Some(team.id),
            role: Some(PlayerRole::Keeper),
        })
        .await
        .unwrap();

    let block = ctx
        .store
        .create_content_block(NewContentBlock {
            event_id: ctx.event_id,
            key: "seeker-hint".into(),
            kind: "text".into(),
            payload: json!({"text": "look under the bridge"}),
            audience: Audience::Seeker,
            station_id: None,
        })
        .await
        .unwrap();

    let outcomes =
        ctx.engine.deliver_now(&ctx.admin, block.id, AudienceTarget::AllTeams).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].record().player_id, Some(seeker.id));
}

#[tokio::test]
async fn interactive_reply_gates_flags_and_delivers_idempotently() {
    let ctx = setup().await;
    let team = ctx.team("T1").await;
    let player = ctx
        .store
        .register_player(NewPlayer {
            event_id: ctx.event_id,
            external_id: "ext-1".into(),
            team_id: Some(team.id),
            role: Some(PlayerRole::Seeker),
        })
        .await
        .unwrap();
    let player_scope = Scope::player(ctx.event_id, team.id, player.id);

    let fallback_block = ctx
        .store
        .create_content_block(NewContentBlock {
            event_id: ctx.event_id,
            key: "courier-fallback".into(),
            kind: "dialogue".into(),
            payload: json!({"text": "I don't follow."}),
            audience: Audience::Player,
            station_id: None,
        })
        .await
        .unwrap();
    let secret_block = ctx
        .store
        .create_content_block(NewContentBlock {
            event_id: ctx.event_id,
            key: "courier-secret".into(),
            kind: "dialogue".into(),
            payload: json!({"text": "The cellar door is open."}),
            audience: Audience::Player,
            station_id: None,
        })
        .await
        .unwrap();

    let thread = ctx
        .store
        .create_thread(NewThread {
            event_id: ctx.event_id,
            key: "courier".into(),
            kind: DialogueKind::Interactive,
            title: "The Courier".into(),
            config: json!({}),
        })
        .await
        .unwrap();

    let secret = ctx
        .store
        .create_message(NewMessage {
            event_id: ctx.event_id,
            thread_id: thread.id,
            content_block_id: secret_block.id,
            audience: Audience::Team,
            payload: json!({"text": "The cellar door is open."}),
            order_index: 0,
            gate_rules: Some(json!({"keywords": ["lantern"]})),
            flag_effects: Some(json!({"knows_cellar": true})),
        })
        .await
        .unwrap();
    // An ungated opener; not a reply candidate (fallback selection is
    // covered by the evaluator's unit tests).
    ctx.store
        .create_message(NewMessage {
            event_id: ctx.event_id,
            thread_id: thread.id,
            content_block_id: fallback_block.id,
            audience: Audience::Team,
            payload: json!({"text": "I don't follow."}),
            order_index: 1,
            gate_rules: None,
            flag_effects: None,
        })
        .await
        .unwrap();

    let response =
        ctx.engine.dialogue_reply(&player_scope, "courier", "I brought the lantern").await.unwrap();
    assert_eq!(response.unwrap().id, secret.id);

    // Flag effect applied.
    let after = ctx.store.player(player.id).await.unwrap();
    assert_eq!(after.flags["knows_cellar"], json!(true));

    // Replying again re-selects the message but delivers nothing new.
    let deliveries_before =
        ctx.store.deliveries_for_player(team.id, player.id).await.unwrap().len();
    ctx.engine.dialogue_reply(&player_scope, "courier", "the lantern, again").await.unwrap();
    let deliveries_after =
        ctx.store.deliveries_for_player(team.id, player.id).await.unwrap().len();
    assert_eq!(deliveries_before, deliveries_after);

    // An unmatched reply with no configured fallback yields no response.
    let none = ctx.engine.dialogue_reply(&player_scope, "courier", "hello?").await.unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn leaked_thread_shows_delivered_audience_matched_messages() {
    let ctx = setup().await;
    let team = ctx.team("T1").await;
    let player = ctx
        .store
        .register_player(NewPlayer {
            event_id: ctx.event_id,
            external_id: "ext-1".into(),
            team_id: Some(team.id),
            role: Some(PlayerRole::Keeper),
        })
        .await
        .unwrap();
    let player_scope = Scope::player(ctx.event_id, team.id, player.id);

    let block = ctx
        .store
        .create_content_block(NewContentBlock {
            event_id: ctx.event_id,
            key: "intercepted-1".into(),
            kind: "dialogue".into(),
            payload: json!({"text": "they moved the drop point"}),
            audience: Audience::Team,
            station_id: None,
        })
        .await
        .unwrap();
    let thread = ctx
        .store
        .create_thread(NewThread {
            event_id: ctx.event_id,
            key: "intercepted".into(),
            kind: DialogueKind::Leaked,
            title: "Intercepted".into(),
            config: json!({}),
        })
        .await
        .unwrap();
    ctx.store
        .create_message(NewMessage {
            event_id: ctx.event_id,
            thread_id: thread.id,
            content_block_id: block.id,
            audience: Audience::Team,
            payload: json!({"text": "they moved the drop point"}),
            order_index: 0,
            gate_rules: None,
            flag_effects: None,
        })
        .await
        .unwrap();

    // Nothing delivered yet: thread reads empty.
    let visible = ctx.engine.leaked_messages(&player_scope, "intercepted").await.unwrap();
    assert!(visible.is_empty());

    // After delivery the message is visible.
    ctx.engine
        .deliver_now(&ctx.admin, block.id, AudienceTarget::Teams { team_ids: vec![team.id] })
        .await
        .unwrap();
    let visible = ctx.engine.leaked_messages(&player_scope, "intercepted").await.unwrap();
    assert_eq!(visible.len(), 1);
}

#[tokio::test]
async fn rating_is_player_scoped_and_single_shot() {
    let ctx = setup().await;
    let station = ctx.station("A", 1).await;
    let host = Scope::host(ctx.event_id, station.id);
    let team = ctx.team("T1").await;
    let player = ctx
        .store
        .register_player(NewPlayer {
            event_id: ctx.event_id,
            external_id: "ext-1".into(),
            team_id: Some(team.id),
            role: Some(PlayerRole::Seeker),
        })
        .await
        .unwrap();
    let player_scope = Scope::player(ctx.event_id, team.id, player.id);

    ctx.engine.assign_team(&ctx.admin, team.id, station.id).await.unwrap();
    let token = ctx.engine.issue_scan_token(&ctx.admin, team.id).await.unwrap();
    let visit = ctx.engine.arrive(&host, &token, station.id).await.unwrap();

    // Too early: visit not finished.
    let err =
        ctx.engine.submit_rating(&player_scope, visit.id, 5, 5, None).await.unwrap_err();
    assert!(matches!(err, QuestlineError::InvalidTransition(_)));

    ctx.engine.start_visit(&host, visit.id).await.unwrap();
    ctx.engine.finish_visit(&host, visit.id, 30.0, None, None, false).await.unwrap();

    let first = ctx.engine.submit_rating(&player_scope, visit.id, 5, 4, None).await.unwrap();
    assert!(first.is_created());
    let second = ctx.engine.submit_rating(&player_scope, visit.id, 1, 1, None).await.unwrap();
    assert!(!second.is_created());
    assert_eq!(second.record().station_rating, 5);
}

#[tokio::test]
async fn scope_gates_reject_wrong_roles() {
    let ctx = setup().await;
    let team = ctx.team("T1").await;
    let station = ctx.station("A", 1).await;
    let player_scope = Scope::player(ctx.event_id, team.id, 999);
    let host = Scope::host(ctx.event_id, station.id);

    assert!(matches!(
        ctx.engine.assign_team(&player_scope, team.id, station.id).await.unwrap_err(),
        QuestlineError::ScopeViolation(_)
    ));
    assert!(matches!(
        ctx.engine.assign_team(&host, team.id, station.id).await.unwrap_err(),
        QuestlineError::ScopeViolation(_)
    ));

    let foreign_admin = Scope::admin(ctx.event_id + 100);
    assert!(matches!(
        ctx.engine.assign_team(&foreign_admin, team.id, station.id).await.unwrap_err(),
        QuestlineError::NotFound(_)
    ));
}
