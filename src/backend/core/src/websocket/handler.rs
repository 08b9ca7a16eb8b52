//! WebSocket upgrade and per-connection pump.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::api::AppState;

use super::broadcast::CONNECTION_BUFFER;

/// Upgrade `GET /ws` to a websocket session.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump broadcast messages to the client until either side closes.
///
/// Inbound frames are drained and ignored; the protocol is push-only.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(CONNECTION_BUFFER);
    let connection_id = state.broadcaster.register(tx);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.broadcaster.unregister(connection_id);
    debug!(%connection_id, "WebSocket session ended");
}
