//! WebSocket session transport.
//!
//! Each connection on `/ws` is one session: text frames carry one JSON
//! command each, and everything the relay publishes for the session is sent
//! back as one JSON text frame per message. `/health` reports connection
//! state for every network.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use bnc_core::relay::RelayHandle;
use tower_http::cors::CorsLayer;

/// Give up on a client that stops reading.
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub fn router(relay: RelayHandle) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(relay)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(relay): State<RelayHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, relay))
}

async fn handle_ws(mut socket: WebSocket, relay: RelayHandle) {
    let (session, mut outbound) = relay.attach();
    tracing::info!(session = %session, "Session attached");

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        relay.submit_frame(session, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        relay.submit_frame(session, &String::from_utf8_lossy(&data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ping/Pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(session = %session, error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
            msg = outbound.recv() => {
                // None: the broadcaster dropped this session (full queue).
                let Some(msg) = msg else { break };
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(session = %session, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                let send = socket.send(WsMessage::Text(text.into()));
                match tokio::time::timeout(WS_SEND_TIMEOUT, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        tracing::debug!(session = %session, "WebSocket send failed or timed out");
                        break;
                    }
                }
            }
        }
    }

    relay.detach(session);
    let _ = socket.send(WsMessage::Close(None)).await;
    tracing::info!(session = %session, "Session detached");
}

async fn health(State(relay): State<RelayHandle>) -> impl IntoResponse {
    match relay.status().await {
        Some(status) => Json(status).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
