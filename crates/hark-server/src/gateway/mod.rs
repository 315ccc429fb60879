//! Externally reachable surface: the REST API and the WebSocket fan-out.
//!
//! Two listeners share one application state: the HTTP API on `PORT_HTTP`
//! and the WebSocket subscribe endpoint (plus `/clients`) on `PORT_WS`.
//! Every request except `/health` passes the peer gate first.

pub mod http;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::service::Relay;

pub type SharedRelay = Arc<Relay>;

/// Bind and serve the REST API until `shutdown` flips.
pub async fn serve_http(
    relay: SharedRelay,
    port: u16,
    shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    tracing::info!(addr = %addr, "HTTP API listening");

    let app = http::api_router(relay);
    let mut shutdown = shutdown;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|&v| v).await;
    })
    .await
    .map_err(|e| format!("HTTP server error: {e}"))
}

/// Bind and serve the WebSocket listener until `shutdown` flips.
pub async fn serve_ws(
    relay: SharedRelay,
    port: u16,
    shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    tracing::info!(addr = %addr, "WebSocket listener ready");

    let app = ws::ws_router(relay);
    let mut shutdown = shutdown;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|&v| v).await;
    })
    .await
    .map_err(|e| format!("WebSocket server error: {e}"))
}
