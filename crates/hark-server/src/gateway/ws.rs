//! WebSocket fan-out.
//!
//! On connect a client gets the current state and a history snapshot, then
//! a live relay of the event bus. The server pings every 30 seconds and
//! drops a connection that misses three in a row. Clients may send `ack`
//! and `abort` commands; anything else is ignored.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use hark_types::{BusEvent, ClientCommand, ClientInfo, ClientKind};

use super::SharedRelay;

/// Interval between server pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive unanswered pings before the connection is dropped.
const MAX_MISSED_PINGS: u32 = 3;

/// Build the WebSocket-side router (`/ws`, `/health`, `/clients`).
pub fn ws_router(relay: SharedRelay) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(ws_health))
        .route("/clients", get(ws_clients))
        .with_state(relay)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    device: Option<String>,
    id: Option<String>,
}

async fn ws_health(State(relay): State<SharedRelay>) -> impl IntoResponse {
    let snapshot = relay.state.snapshot().await;
    Json(json!({"status": "ok", "clients": snapshot.clients.len()}))
}

async fn ws_clients(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !relay.auth.verify(addr.ip()).await {
        return (StatusCode::FORBIDDEN, "unauthorized node").into_response();
    }
    let snapshot = relay.state.snapshot().await;
    Json(json!({"clients": snapshot.clients})).into_response()
}

async fn ws_upgrade(
    State(relay): State<SharedRelay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if !relay.auth.verify(addr.ip()).await {
        return (StatusCode::FORBIDDEN, "unauthorized node").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(relay, socket, addr, params))
}

/// Parse the `device` query value into a client kind; anything
/// unrecognised is `Unknown`.
fn client_kind(device: Option<&str>) -> ClientKind {
    device
        .and_then(|d| serde_json::from_value(serde_json::Value::String(d.to_string())).ok())
        .unwrap_or_default()
}

async fn handle_socket(relay: SharedRelay, socket: WebSocket, addr: SocketAddr, params: WsParams) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let client = ClientInfo {
        session_id: session_id.clone(),
        kind: client_kind(params.device.as_deref()),
        device_id: params.id.unwrap_or_default(),
        peer: addr.to_string(),
        connected_at: Utc::now(),
    };

    // Subscribe before snapshotting so nothing published in between is lost;
    // a client may at worst see an event twice across the boundary.
    let mut subscription = relay.bus.subscribe();
    relay.state.client_connected(client);
    let snapshot = relay.state.snapshot().await;

    let (mut sink, stream) = socket.split();

    let mut initial = vec![
        BusEvent::StateChanged {
            status: snapshot.status,
            turn_id: snapshot.turn_id.clone(),
        },
        BusEvent::HistorySnapshot {
            messages: snapshot.messages,
        },
    ];
    if let Some(prompt) = snapshot.prompt {
        initial.push(BusEvent::PromptPosted { prompt });
    }
    if let Some(usage) = snapshot.usage {
        initial.push(BusEvent::UsageUpdated { usage });
    }
    for event in initial {
        if send_event(&mut sink, &event).await.is_err() {
            relay.state.client_disconnected(session_id);
            return;
        }
    }

    let missed_pings = Arc::new(AtomicU32::new(0));

    let writer_missed = Arc::clone(&missed_pings);
    let mut writer = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => {
                        if send_event(&mut sink, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    let missed = writer_missed.fetch_add(1, Ordering::SeqCst) + 1;
                    if missed > MAX_MISSED_PINGS {
                        tracing::info!(missed, "client missed heartbeats, closing");
                        break;
                    }
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let reader_relay = Arc::clone(&relay);
    let reader_missed = Arc::clone(&missed_pings);
    let mut reader = tokio::spawn(async move {
        read_client(reader_relay, stream, reader_missed).await;
    });

    // Whichever side finishes first tears the connection down.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    relay.state.client_disconnected(session_id);
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &BusEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(json.into())).await
}

async fn read_client(
    relay: SharedRelay,
    mut stream: SplitStream<WebSocket>,
    missed_pings: Arc<AtomicU32>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Pong(_)) => {
                missed_pings.store(0, Ordering::SeqCst);
            }
            Ok(Message::Text(text)) => {
                missed_pings.store(0, Ordering::SeqCst);
                match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(ClientCommand::Ack { id }) => {
                        if let Err(e) = relay.ack(&id).await {
                            tracing::debug!(turn_id = %id, error = %e, "ws ack failed");
                        }
                    }
                    Ok(ClientCommand::Abort) => {
                        if let Err(e) = relay.abort().await {
                            tracing::warn!(error = %e, "ws abort failed");
                        }
                    }
                    Err(_) => {
                        tracing::debug!(frame = %text, "ignoring unknown client command");
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_param_maps_to_client_kind() {
        assert_eq!(client_kind(Some("watch")), ClientKind::Watch);
        assert_eq!(client_kind(Some("phone")), ClientKind::Phone);
        assert_eq!(client_kind(Some("dashboard")), ClientKind::Dashboard);
        assert_eq!(client_kind(Some("viewer")), ClientKind::Viewer);
        assert_eq!(client_kind(Some("toaster")), ClientKind::Unknown);
        assert_eq!(client_kind(None), ClientKind::Unknown);
    }
}
