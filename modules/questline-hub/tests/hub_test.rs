//! Fan-out behavior of the hub: isolation, ordering, dead-subscriber pruning.

use questline_common::{Channel, Envelope, Scope, TeamState};
use questline_hub::Hub;

fn team_state(team_id: i64) -> Envelope {
    Envelope::TeamStateChanged { team_id, state: TeamState::Assigned, station_id: Some(1) }
}

#[tokio::test]
async fn envelope_reaches_only_the_published_channel() {
    let hub = Hub::new();

    let (conn5, mut rx5) = hub.register(Scope::player(1, 5, 100)).await;
    let (conn7, mut rx7) = hub.register(Scope::player(1, 7, 200)).await;
    hub.subscribe(conn5, Channel::Team(5)).await.unwrap();
    hub.subscribe(conn7, Channel::Team(7)).await.unwrap();

    let delivered = hub.publish(Channel::Team(7), &team_state(7)).await;
    assert_eq!(delivered, 1);

    assert!(rx7.try_recv().is_ok());
    assert!(rx5.try_recv().is_err(), "team:5 subscriber must not see team:7 traffic");
}

#[tokio::test]
async fn player_cannot_subscribe_to_admin_or_foreign_team() {
    let hub = Hub::new();
    let (conn, _rx) = hub.register(Scope::player(1, 5, 100)).await;

    assert!(hub.subscribe(conn, Channel::Team(5)).await.is_ok());
    assert!(hub.subscribe(conn, Channel::Event(1)).await.is_ok());
    assert!(hub.subscribe(conn, Channel::Team(7)).await.is_err());
    assert!(hub.subscribe(conn, Channel::Admin(1)).await.is_err());
}

#[tokio::test]
async fn envelopes_arrive_in_publish_order() {
    let hub = Hub::new();
    let (conn, mut rx) = hub.register(Scope::admin(1)).await;
    hub.subscribe(conn, Channel::Admin(1)).await.unwrap();

    for visit_id in 1..=20 {
        hub.publish(Channel::Admin(1), &Envelope::AdminVisitUpdate { visit_id }).await;
    }

    for expected in 1..=20 {
        match rx.recv().await.unwrap() {
            Envelope::AdminVisitUpdate { visit_id } => assert_eq!(visit_id, expected),
            other => panic!("unexpected envelope {other:?}"),
        }
    }
}

#[tokio::test]
async fn dropped_receiver_is_pruned_and_does_not_block_others() {
    let hub = Hub::new();

    let (gone, rx_gone) = hub.register(Scope::player(1, 5, 100)).await;
    let (alive, mut rx_alive) = hub.register(Scope::player(1, 5, 101)).await;
    hub.subscribe(gone, Channel::Team(5)).await.unwrap();
    hub.subscribe(alive, Channel::Team(5)).await.unwrap();

    drop(rx_gone);

    let delivered = hub.publish(Channel::Team(5), &team_state(5)).await;
    assert_eq!(delivered, 1);
    assert!(rx_alive.try_recv().is_ok());

    // The dead connection was implicitly unsubscribed.
    assert_eq!(hub.subscriber_count(Channel::Team(5)).await, 1);
    assert_eq!(hub.connection_count().await, 1);
}

#[tokio::test]
async fn slow_subscriber_is_dropped_once_its_queue_fills() {
    let hub = Hub::new();
    let (slow, _rx_kept_but_never_read) = hub.register(Scope::admin(1)).await;
    hub.subscribe(slow, Channel::Admin(1)).await.unwrap();

    // Push until far past the outbound buffer. The publish calls must all
    // return rather than block, and the connection must eventually be shed.
    for visit_id in 0..1000 {
        hub.publish(Channel::Admin(1), &Envelope::AdminVisitUpdate { visit_id }).await;
    }

    assert_eq!(hub.subscriber_count(Channel::Admin(1)).await, 0);
}

#[tokio::test]
async fn unregister_removes_all_subscriptions() {
    let hub = Hub::new();
    let (conn, _rx) = hub.register(Scope::admin(1)).await;
    hub.subscribe(conn, Channel::Admin(1)).await.unwrap();
    hub.subscribe(conn, Channel::Event(1)).await.unwrap();

    hub.unregister(conn).await;

    assert_eq!(hub.subscriber_count(Channel::Admin(1)).await, 0);
    assert_eq!(hub.subscriber_count(Channel::Event(1)).await, 0);
    assert_eq!(hub.publish(Channel::Event(1), &team_state(1)).await, 0);
}
