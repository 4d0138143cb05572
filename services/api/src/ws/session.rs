//! Manages the WebSocket connection lifecycle for a conversation.

use super::{
    protocol::{ClientMessage, ServerMessage, resolve_topic},
    rig::RemoteRig,
};
use crate::state::AppState;
use anyhow::{Context, Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use darwin_core::animation::Clip;
use darwin_core::coordinator::{Command, ConversationCoordinator};
use darwin_core::models::Topic;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, error, info, instrument, warn};
use uuid::Uuid;

const COMMAND_BUFFER: usize = 32;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// The first client message must be `init`. Once it is accepted the
/// conversation loop runs until the client disconnects.
#[instrument(name = "ws_session", skip_all, fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    tracing::Span::current().record("connection_id", tracing::field::display(connection_id));
    info!("New WebSocket connection. Awaiting initialization...");

    let (mut socket_tx, mut socket_rx) = socket.split();

    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_init(&text),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let (topic, clips) = match init {
        Ok(init) => init,
        Err(e) => {
            error!(error = ?e, "Session initialization failed");
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let span = tracing::info_span!("conversation", topic = %topic.topic, subject = %topic.subject);
    if let Err(e) = run_conversation(state, socket_tx, socket_rx, topic, clips)
        .instrument(span)
        .await
    {
        error!(error = ?e, "Conversation terminated with error.");
    }
    info!("WebSocket connection closed.");
}

fn parse_init(text: &str) -> Result<(Topic, Option<Vec<Clip>>)> {
    let msg: ClientMessage = serde_json::from_str(text).context("Malformed `init` message")?;
    match msg {
        ClientMessage::Init {
            topic,
            subject,
            preset,
            clips,
        } => Ok((resolve_topic(topic, subject, preset)?, clips)),
        _ => Err(anyhow!("First message must be `init`")),
    }
}

/// Runs one coordinator for the connection and bridges it to the socket.
async fn run_conversation(
    state: Arc<AppState>,
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut socket_rx: SplitStream<WebSocket>,
    topic: Topic,
    clips: Option<Vec<Clip>>,
) -> Result<()> {
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

    let coordinator = ConversationCoordinator::new(
        state.conversation_service.clone(),
        state.evaluation_service.clone(),
        Box::new(RemoteRig::new(clips, ui_tx.clone())),
        state.coordinator_settings(),
        ui_tx,
    );
    let coordinator_task = tokio::spawn(coordinator.run(command_rx).in_current_span());
    command_tx
        .send(Command::Start(topic))
        .await
        .context("Coordinator stopped before start")?;

    let result = loop {
        tokio::select! {
            msg_result = socket_rx.next() => match msg_result {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => match msg.into_command() {
                        Some(command) => {
                            if command_tx.send(command).await.is_err() {
                                break Err(anyhow!("Coordinator stopped unexpectedly"));
                            }
                        }
                        None => warn!("Ignoring repeated `init` message."),
                    },
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed client message.");
                        let reply = ServerMessage::Error {
                            message: format!("Malformed message: {e}"),
                        };
                        if let Err(e) = send_msg(&mut socket_tx, reply).await {
                            break Err(e);
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the connection.");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Error receiving from client WebSocket: {:?}", e);
                    break Ok(());
                }
            },
            Some(event) = ui_rx.recv() => {
                if let Err(e) = send_msg(&mut socket_tx, ServerMessage::from(event)).await {
                    break Err(e);
                }
            },
        }
    };

    drop(command_tx);
    if let Err(e) = coordinator_task.await {
        error!(error = ?e, "Coordinator task failed");
    }
    result
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init() {
        let (topic, clips) =
            parse_init(r#"{"type":"init","preset":"chemistry","clips":["idle","eat"]}"#).unwrap();
        assert_eq!(topic, Topic::new("Chemical Reactions", "Chemistry"));
        assert_eq!(clips, Some(vec![Clip::Idle, Clip::Eat]));

        assert!(parse_init(r#"{"type":"user_message","text":"hi"}"#).is_err());
        assert!(parse_init("not json").is_err());
    }
}
