//! Push socket forwarding scan events to connected clients

use crate::registry::ScanRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Events a client may fall behind by before the hub drops it
const EVENT_BACKLOG: usize = 256;

/// Messages generated by the socket itself rather than by scans
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketMessage {
    /// Reply to a client text frame
    Echo { data: String },
}

/// WebSocket handler for live scan events
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<ScanRegistry>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

/// Forward hub events to one client until either side goes away
async fn handle_socket(mut socket: WebSocket, registry: Arc<ScanRegistry>) {
    let hub = registry.hub();
    let (subscriber, mut events) = hub.subscribe_bounded(EVENT_BACKLOG);
    tracing::info!(subscriber, "WebSocket client connected");

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(payload) => {
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    // The hub dropped us after a failed or overflowing delivery
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if send_message(&mut socket, &SocketMessage::Echo { data: text }).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::debug!(subscriber, "WebSocket connection closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(subscriber, error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
        }
    }

    hub.unsubscribe(subscriber);
    tracing::info!(subscriber, "WebSocket connection terminated");
}

async fn send_message(socket: &mut WebSocket, message: &SocketMessage) -> Result<(), axum::Error> {
    let json_str = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(json_str)).await
}
