//! Integration tests for PgStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use serde_json::json;
use sqlx::PgPool;

use questline_common::{Audience, QuestlineError, TeamState};
use questline_store::{
    NewContentBlock, NewDelivery, NewPlayer, NewStation, NewTeam, NewVisit, PgStore, StateStore,
};

/// Get a store on the test database, or skip if none is available.
async fn test_store() -> Option<PgStore> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    // Clean slate for each test run.
    sqlx::query(
        "DROP TABLE IF EXISTS ratings, dialogue_messages, dialogue_threads, deliveries, \
         content_blocks, station_visits, stations, players, teams, events CASCADE",
    )
    .execute(&pool)
    .await
    .ok()?;

    let store = PgStore::new(pool);
    store.ensure_schema().await.ok()?;
    Some(store)
}

#[tokio::test]
async fn delivery_unique_constraint_holds_in_postgres() {
    let Some(store) = test_store().await else {
        return;
    };

    let event = store.create_event("ev", "pg-delivery").await.unwrap();
    let team = store.create_team(NewTeam { event_id: event.id, name: "t1".into() }).await.unwrap();
    let block = store
        .create_content_block(NewContentBlock {
            event_id: event.id,
            key: "k1".into(),
            kind: "text".into(),
            payload: json!({}),
            audience: Audience::Team,
            station_id: None,
        })
        .await
        .unwrap();

    let new = NewDelivery {
        event_id: event.id,
        content_block_id: block.id,
        team_id: team.id,
        player_id: None,
    };
    let first = store.insert_delivery(new.clone()).await.unwrap();
    assert!(first.is_created());
    let second = store.insert_delivery(new.clone()).await.unwrap();
    assert!(!second.is_created());
    assert_eq!(second.record().id, first.record().id);

    // Player-specific delivery of the same block is a distinct key.
    let player = store
        .register_player(NewPlayer {
            event_id: event.id,
            external_id: "ext-1".into(),
            team_id: Some(team.id),
            role: None,
        })
        .await
        .unwrap();
    let specific = store
        .insert_delivery(NewDelivery { player_id: Some(player.id), ..new })
        .await
        .unwrap();
    assert!(specific.is_created());
}

#[tokio::test]
async fn score_increment_is_atomic_in_postgres() {
    let Some(store) = test_store().await else {
        return;
    };

    let event = store.create_event("ev", "pg-score").await.unwrap();
    let team =
        store.create_team(NewTeam { event_id: event.id, name: "t-score".into() }).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        let team_id = team.id;
        handles.push(tokio::spawn(async move { store.add_score(team_id, 5.0).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(store.team(team.id).await.unwrap().score_total, 50.0);
}

#[tokio::test]
async fn reregistration_rejected_in_postgres() {
    let Some(store) = test_store().await else {
        return;
    };

    let event = store.create_event("ev", "pg-register").await.unwrap();
    let new = NewPlayer {
        event_id: event.id,
        external_id: "ext-dup".into(),
        team_id: None,
        role: None,
    };
    store.register_player(new.clone()).await.unwrap();
    assert!(matches!(
        store.register_player(new).await.unwrap_err(),
        QuestlineError::AlreadyRegistered
    ));
}

#[tokio::test]
async fn team_update_roundtrips_state_and_preserves_score() {
    let Some(store) = test_store().await else {
        return;
    };

    let event = store.create_event("ev", "pg-team").await.unwrap();
    let station = store
        .create_station(NewStation { event_id: event.id, name: "s1".into(), capacity: 2 })
        .await
        .unwrap();
    let mut team =
        store.create_team(NewTeam { event_id: event.id, name: "t1".into() }).await.unwrap();

    store.add_score(team.id, 12.5).await.unwrap();

    team.current_state = TeamState::Assigned;
    team.current_station_id = Some(station.id);
    store.update_team(&team).await.unwrap();

    let loaded = store.team(team.id).await.unwrap();
    assert_eq!(loaded.current_state, TeamState::Assigned);
    assert_eq!(loaded.current_station_id, Some(station.id));
    // update_team never writes the score column.
    assert_eq!(loaded.score_total, 12.5);
}

#[tokio::test]
async fn active_visit_queries_ignore_finished_visits() {
    let Some(store) = test_store().await else {
        return;
    };

    let event = store.create_event("ev", "pg-visits").await.unwrap();
    let station = store
        .create_station(NewStation { event_id: event.id, name: "s1".into(), capacity: 3 })
        .await
        .unwrap();
    let team = store.create_team(NewTeam { event_id: event.id, name: "t1".into() }).await.unwrap();

    let mut visit = store
        .create_visit(NewVisit {
            event_id: event.id,
            team_id: team.id,
            station_id: station.id,
            state: questline_common::VisitState::Arrived,
        })
        .await
        .unwrap();
    assert_eq!(store.active_visit_count(station.id).await.unwrap(), 1);
    assert!(store.active_visit(team.id, station.id).await.unwrap().is_some());

    visit.state = questline_common::VisitState::Finished;
    visit.ended_at = Some(chrono::Utc::now());
    store.update_visit(&visit).await.unwrap();

    assert_eq!(store.active_visit_count(station.id).await.unwrap(), 0);
    assert!(store.active_visit(team.id, station.id).await.unwrap().is_none());
    assert_eq!(store.finished_station_ids(team.id).await.unwrap(), vec![station.id]);
}
