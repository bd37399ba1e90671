//! The persistent per-agent event channel (spec §6.2). A thin bridge between
//! an agent's WebSocket connection and its [`EventBus`] room: messages in
//! either direction are plain JSON using the same [`AgentMessage`] envelope
//! the rest of the system uses.

use super::ApiServer;
use crate::event_bus::AgentMessage;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(app): State<Arc<ApiServer>>,
    Path(name): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app, name))
}

async fn handle_socket(socket: WebSocket, app: Arc<ApiServer>, agent_name: String) {
    let mut rx = app.events.join_room(&agent_name);
    let (mut sink, mut stream) = socket.split();

    let outbound = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode outbound agent message");
                    continue;
                }
            };
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        match serde_json::from_str::<AgentMessage>(&text) {
            Ok(AgentMessage::Pong { .. }) => {
                tracing::debug!(agent = %agent_name, "pong received over persistent channel");
            }
            Ok(AgentMessage::JoinRoom { name }) if name == agent_name => {
                tracing::debug!(agent = %agent_name, "agent re-joined its room");
            }
            Ok(AgentMessage::LeaveRoom { .. }) => break,
            Ok(other) => {
                tracing::debug!(agent = %agent_name, ?other, "unexpected inbound message on agent channel");
            }
            Err(e) => {
                tracing::warn!(agent = %agent_name, error = %e, "malformed message on agent channel");
            }
        }
    }

    outbound.abort();
    app.events.leave_room(&agent_name);
    tracing::info!(agent = %agent_name, "agent disconnected from persistent channel");
}
