//! Pub/Sub hub — fans out envelopes to connected clients by channel,
//! enforcing scope on subscribe.
//!
//! The hub persists nothing. Envelopes are notifications of change; a
//! reconnecting client reconciles by re-fetching state from the store, not by
//! replaying missed envelopes. Delivery is best-effort per connection: each
//! connection has a bounded outbound queue, and a connection whose queue is
//! full or whose receiver is gone is dropped from all its subscriptions
//! without blocking delivery to anyone else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use questline_common::{Channel, Envelope, QuestlineError, Scope, UserRole};

pub type ConnectionId = Uuid;

/// Outbound queue depth per connection. A client that falls this far behind
/// is dropped rather than allowed to stall the channel.
const OUTBOUND_BUFFER: usize = 256;

struct ConnectionEntry {
    scope: Scope,
    sender: mpsc::Sender<Envelope>,
    channels: HashSet<Channel>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    channels: HashMap<Channel, HashSet<ConnectionId>>,
}

#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<RwLock<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with its verified scope. The returned receiver
    /// is the connection's outbound envelope stream.
    pub async fn register(&self, scope: Scope) -> (ConnectionId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let id = Uuid::new_v4();
        let mut state = self.inner.write().await;
        state.connections.insert(
            id,
            ConnectionEntry { scope, sender: tx, channels: HashSet::new() },
        );
        (id, rx)
    }

    /// Drop a connection from the registry and all its channels.
    pub async fn unregister(&self, id: ConnectionId) {
        let mut state = self.inner.write().await;
        remove_connection(&mut state, id);
    }

    /// Subscribe a connection to a channel. Rejected with `ScopeViolation`
    /// when the channel is outside the connection's scope.
    pub async fn subscribe(&self, id: ConnectionId, channel: Channel) -> Result<(), QuestlineError> {
        let mut state = self.inner.write().await;
        let entry = state
            .connections
            .get_mut(&id)
            .ok_or_else(|| QuestlineError::NotFound(format!("connection {id}")))?;

        if !channel_allowed(&entry.scope, channel) {
            return Err(QuestlineError::ScopeViolation(format!(
                "{} may not subscribe to {channel}",
                entry.scope.role
            )));
        }

        entry.channels.insert(channel);
        state.channels.entry(channel).or_default().insert(id);
        Ok(())
    }

    pub async fn unsubscribe(&self, id: ConnectionId, channel: Channel) {
        let mut state = self.inner.write().await;
        if let Some(entry) = state.connections.get_mut(&id) {
            entry.channels.remove(&channel);
        }
        if let Some(subs) = state.channels.get_mut(&channel) {
            subs.remove(&id);
        }
    }

    /// Deliver an envelope to every current subscriber of the channel.
    /// Returns the number of connections the envelope was queued for.
    ///
    /// Publishes are serialized by the state lock, which is what gives each
    /// subscriber per-channel FIFO ordering. Nothing here awaits a client:
    /// enqueue is `try_send`, and a full or closed queue drops the connection.
    pub async fn publish(&self, channel: Channel, envelope: &Envelope) -> usize {
        let mut state = self.inner.write().await;

        let Some(subscribers) = state.channels.get(&channel) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead: Vec<ConnectionId> = Vec::new();
        for id in subscribers.iter().copied() {
            match state.connections.get(&id) {
                Some(entry) => match entry.sender.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push(id),
                },
                None => dead.push(id),
            }
        }

        for id in dead {
            debug!(connection = %id, %channel, "dropping unresponsive subscriber");
            remove_connection(&mut state, id);
        }

        delivered
    }

    /// Publish the same envelope to several channels. No cross-channel
    /// ordering is implied.
    pub async fn publish_all(&self, channels: &[Channel], envelope: &Envelope) -> usize {
        let mut delivered = 0;
        for channel in channels {
            delivered += self.publish(*channel, envelope).await;
        }
        delivered
    }

    pub async fn subscriber_count(&self, channel: Channel) -> usize {
        let state = self.inner.read().await;
        state.channels.get(&channel).map(|s| s.len()).unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        let state = self.inner.read().await;
        state.connections.len()
    }
}

fn remove_connection(state: &mut HubState, id: ConnectionId) {
    if let Some(entry) = state.connections.remove(&id) {
        for channel in entry.channels {
            if let Some(subs) = state.channels.get_mut(&channel) {
                subs.remove(&id);
            }
        }
    }
}

/// Scope rules for subscription. Players get their own team and the shared
/// event feed; hosts get their station and the event feed; admins get
/// everything within their event.
fn channel_allowed(scope: &Scope, channel: Channel) -> bool {
    match channel {
        Channel::Event(event_id) => event_id == scope.event_id,
        Channel::Admin(event_id) => {
            scope.role == UserRole::Admin && event_id == scope.event_id
        }
        Channel::Team(team_id) => match scope.role {
            UserRole::Admin => true,
            UserRole::Player => scope.team_id == Some(team_id),
            UserRole::StationHost => false,
        },
        Channel::Station(station_id) => match scope.role {
            UserRole::Admin => true,
            UserRole::StationHost => scope.station_id == Some(station_id),
            UserRole::Player => false,
        },
    }
}
