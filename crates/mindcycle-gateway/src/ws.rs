//! WebSocket display clients
//!
//! Push-only: every engine event is forwarded as one JSON text frame.
//! Inbound text is ignored; sensors use the HTTP ingress.

use crate::server::GatewayState;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use mindcycle_core::{EventMessage, Mode};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Serialize an event for the wire.
pub fn encode(event: &EventMessage) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Dropping unserializable {} event: {}", event.event, e);
            None
        }
    }
}

pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Subscribe before the greeting so nothing published in between is missed.
    let mut events = state.events.subscribe();
    info!("Display client connected ({} total)", state.events.receiver_count());

    let mode = match state.engine.status().await {
        Ok(status) => status.mode,
        Err(_) => Mode::default(),
    };
    if let Some(json) = encode(&EventMessage::info(env!("CARGO_PKG_VERSION"), mode)) {
        if ws_tx.send(WsMessage::Text(json)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Display client disconnected");
                        return;
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        debug!("Ignoring {} bytes from display client", text.len());
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return;
                    }
                    // Ping/Pong are answered by axum, Binary is ignored
                    _ => {}
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Some(json) = encode(&event) else { continue };
                        if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                            info!("Display client went away");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Display client lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event broadcast closed");
                        return;
                    }
                }
            }
        }
    }
}
