//! WebSocket stream of engine events
//!
//! Sends one `status` message on connect, then every bus event as JSON
//! tagged by `type` (price_updated, balance_updated, inventory_changed,
//! log_line, halted).

use crate::event_bus::EngineEvent;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(mut socket: WebSocket, state: Arc<AppState>) {
    // Subscribe before the status snapshot so nothing published in between is lost
    let mut events = state.engine.bus().subscribe();
    info!("Event stream opened ({} subscribers)", state.engine.bus().subscriber_count());

    let status = serde_json::json!({
        "type": "status",
        "data": state.engine.status(),
    });
    if socket.send(Message::Text(status.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if !forward(&mut socket, &event).await {
                    break;
                }
            }
            frame = socket.recv() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(text))) => debug!("Ignoring client frame: {}", text),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Event stream socket error: {}", e);
                    break;
                }
            },
        }
    }

    info!("Event stream closed");
}

/// Returns false once the client is gone
async fn forward(socket: &mut WebSocket, event: &EngineEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize engine event: {}", e);
            true
        }
    }
}
