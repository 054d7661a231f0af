//! Per-socket loop.
//!
//! Each socket gets a bounded outbound queue drained by a writer future, and
//! a reader future that feeds client frames to the connection's
//! [`PresenceSession`](crate::coordinator::PresenceSession) in receipt order.
//! Whichever side ends first ends the connection. The writer also hangs up
//! with a close frame once the registry drops the connection.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::protocol::{ClientMessage, ServerMessage};
use crate::coordinator::PresenceCoordinator;
use crate::metrics::ServerMetrics;

pub async fn handle_socket(
    socket: WebSocket,
    coordinator: Arc<PresenceCoordinator>,
    metrics: Arc<ServerMetrics>,
    subject: String,
    send_capacity: usize,
) {
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(send_capacity);

    let mut session = match coordinator.connect(subject, tx.clone()).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "failed to register connection");
            return;
        }
    };
    metrics.connection_opened();
    let conn_id = session.connection_id().to_string();

    if tx
        .send(ServerMessage::Welcome {
            connection_id: conn_id.clone(),
            instance: coordinator.identity().name.clone(),
        })
        .await
        .is_err()
    {
        warn!(conn_id = %conn_id, "Failed to send welcome - channel closed");
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let closed = session.close_token();

    // Task to send messages to WebSocket
    let sender_task = async move {
        loop {
            let msg = tokio::select! {
                _ = closed.cancelled() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Task to handle incoming messages
    let input_task = async {
        while let Some(frame) = ws_receiver.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    metrics.websocket_error();
                    debug!(conn_id = %conn_id, error = %e, "socket read failed");
                    break;
                }
            };
            metrics.message_received();

            let reply = match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => match session.handle(msg).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(conn_id = %conn_id, error = %e, "client message rejected");
                        Some(e.to_message())
                    }
                },
                Err(e) => Some(ServerMessage::error("invalid_message", e.to_string())),
            };

            if let Some(reply) = reply {
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id = %conn_id, "Sender task ended"),
        _ = input_task => debug!(conn_id = %conn_id, "Input task ended"),
    }

    session.disconnect().await;
    metrics.connection_closed();
    debug!(conn_id = %conn_id, subject = session.subject(), "socket closed");
}
