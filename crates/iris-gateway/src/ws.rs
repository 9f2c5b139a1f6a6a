//! The socket surface: a websocket stream of bus events.
//!
//! Subscribers authenticate at handshake (`?token=` query parameter, an
//! `Authorization` header, or a first-frame `{"auth": "<key>"}` message).
//! On attach the current coalesced state is replayed as synthetic `status`
//! and `frame` events, then live events stream in publication order.
//! Periodic pings keep idle connections alive; there is no read timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use iris_types::Event;

use crate::auth::{check_bearer, constant_time_eq};
use crate::server::GatewayState;

/// Keepalive ping cadence.
const KEEPALIVE: Duration = Duration::from_secs(30);

/// How long an unauthenticated connection may wait before sending `auth`.
const AUTH_DEADLINE: Duration = Duration::from_secs(5);

pub async fn socket_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authed = handshake_authenticated(&state, &params, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, authed))
}

fn handshake_authenticated(
    state: &GatewayState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> bool {
    if let Some(token) = params.get("token") {
        if constant_time_eq(token.as_bytes(), state.api_key.as_bytes()) {
            return true;
        }
    }
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    check_bearer(header, &state.api_key)
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, mut authed: bool) {
    let (mut sender, mut receiver) = socket.split();

    // In-band auth: first frame must carry the key.
    if !authed {
        let first = tokio::time::timeout(AUTH_DEADLINE, receiver.next()).await;
        authed = matches!(
            first,
            Ok(Some(Ok(Message::Text(ref text)))) if auth_message_valid(text, &state.api_key)
        );
        if !authed {
            warn!("socket subscriber failed authentication");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    }

    let cell = state.supervisor.bus().snapshot_cell();
    let snapshot = cell.snapshot();

    // Replay the coalesced state so late subscribers start consistent.
    let attach_status = Event::status(snapshot.status, snapshot.details.clone());
    if send_event(&mut sender, &attach_status).await.is_err() {
        return;
    }
    if let Some(frame) = cell.latest_frame() {
        if send_event(&mut sender, &Event::frame(frame)).await.is_err() {
            return;
        }
    }

    let subscriber = state.supervisor.bus().subscribe();
    info!(subscriber = %subscriber.id(), "socket subscriber attached");
    let mut keepalive = tokio::time::interval(KEEPALIVE);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {} // pongs and client chatter
                }
            }
        }
    }

    debug!(
        subscriber = %subscriber.id(),
        lost = subscriber.lost_count(),
        "socket subscriber detached"
    );
}

fn auth_message_valid(text: &str, api_key: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("auth").and_then(|a| a.as_str()).map(String::from))
        .map(|token| constant_time_eq(token.as_bytes(), api_key.as_bytes()))
        .unwrap_or(false)
}

async fn send_event(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &Event,
) -> Result<(), ()> {
    let text = serde_json::to_string(event).map_err(|_| ())?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}
