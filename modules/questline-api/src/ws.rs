//! WebSocket endpoint.
//!
//! A client authenticates with its session token (query param — browsers
//! cannot set headers on WebSocket upgrades), gets registered in the hub
//! with its verified scope, and then subscribes to channels with small JSON
//! frames. Envelopes stream out; a connection that goes quiet past the
//! liveness window is dropped from all its subscriptions. Dropping never
//! affects committed state — envelopes are notifications, not truth.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{interval, Instant};
use tracing::debug;

use questline_common::{Channel, Scope};

use crate::error::ApiError;
use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(75);

#[derive(Deserialize)]
pub struct WsParams {
    pub token: String,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.tokens.verify(&params.token) {
        Ok((_external_id, scope)) => {
            ws.on_upgrade(move |socket| client_loop(state, scope, socket))
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// What a connected client may send: channel management only. All state
/// mutations go through the HTTP handlers.
#[derive(Deserialize)]
struct ClientFrame {
    action: String,
    channel: String,
}

async fn client_loop(state: Arc<AppState>, scope: Scope, socket: WebSocket) {
    let (conn_id, mut envelopes) = state.hub.register(scope).await;
    let (mut outbound, mut inbound) = socket.split();

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            envelope = envelopes.recv() => {
                let Some(envelope) = envelope else { break };
                let Ok(text) = serde_json::to_string(&envelope) else { continue };
                if outbound.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            frame = inbound.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        let reply = handle_frame(&state, conn_id, &text).await;
                        if outbound.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > LIVENESS_TIMEOUT {
                    debug!(connection = %conn_id, "liveness timeout");
                    break;
                }
                if outbound.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.unregister(conn_id).await;
}

async fn handle_frame(
    state: &AppState,
    conn_id: questline_hub::ConnectionId,
    text: &str,
) -> String {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => return error_frame("malformed frame"),
    };

    let channel: Channel = match frame.channel.parse() {
        Ok(channel) => channel,
        Err(()) => return error_frame("unknown channel"),
    };

    match frame.action.as_str() {
        "subscribe" => match state.hub.subscribe(conn_id, channel).await {
            Ok(()) => ack_frame("subscribed", &frame.channel),
            Err(e) => error_frame(&e.to_string()),
        },
        "unsubscribe" => {
            state.hub.unsubscribe(conn_id, channel).await;
            ack_frame("unsubscribed", &frame.channel)
        }
        _ => error_frame("unknown action"),
    }
}

fn ack_frame(event: &str, channel: &str) -> String {
    json!({"event": event, "data": {"channel": channel}}).to_string()
}

fn error_frame(message: &str) -> String {
    json!({"event": "error", "data": {"message": message}}).to_string()
}
