//! WebSocket fan-out of lifecycle events.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::state::AppState;

pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| forward_events(socket, state))
}

async fn forward_events(mut socket: WebSocket, state: AppState) {
    let mut events = state.coordinator.events().subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let Ok(payload) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    debug!("websocket client disconnected");
                    return;
                }
            }
            // A slow client lost some events; keep streaming the rest.
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "websocket subscriber lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
