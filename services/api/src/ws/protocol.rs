//! Defines the WebSocket message protocol between the browser client and the API server.

use anyhow::{Result, anyhow};
use darwin_core::UiEvent;
use darwin_core::animation::{AnimationEffect, Clip};
use darwin_core::coordinator::Command;
use darwin_core::evaluation::EvaluationResult;
use darwin_core::models::{Message, Topic};
use darwin_core::prompt;
use serde::{Deserialize, Serialize};

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts the conversation. This must be the first message.
    Init {
        topic: Option<String>,
        subject: Option<String>,
        /// A preset key, used instead of `topic`/`subject`.
        preset: Option<String>,
        /// Clips the loaded avatar model provides. Defaults to all of them.
        clips: Option<Vec<Clip>>,
    },
    /// A text message from the teacher to the avatar.
    UserMessage { text: String },
    ChangeTopic { topic: String, subject: String },
    SetQuackMode { enabled: bool },
    /// Requests an evaluation right away.
    Evaluate,
    /// The renderer finished playing a one-shot clip.
    ClipFinished { clip: Clip },
    SignOut,
}

impl ClientMessage {
    /// Maps a post-handshake message onto a coordinator command.
    /// `init` has no command and yields `None`.
    pub fn into_command(self) -> Option<Command> {
        let command = match self {
            ClientMessage::Init { .. } => return None,
            ClientMessage::UserMessage { text } => Command::Submit(text),
            ClientMessage::ChangeTopic { topic, subject } => {
                Command::ChangeTopic(Topic::new(topic, subject))
            }
            ClientMessage::SetQuackMode { enabled } => Command::SetQuackMode(enabled),
            ClientMessage::Evaluate => Command::Evaluate,
            ClientMessage::ClipFinished { clip } => Command::ClipFinished(clip),
            ClientMessage::SignOut => Command::SignOut,
        };
        Some(command)
    }
}

/// Picks the lesson of an `init` message: a preset key wins, then an
/// explicit topic and subject, then the default preset.
pub fn resolve_topic(
    topic: Option<String>,
    subject: Option<String>,
    preset: Option<String>,
) -> Result<Topic> {
    if let Some(key) = preset {
        return prompt::preset(&key)
            .map(|p| p.to_topic())
            .ok_or_else(|| anyhow!("Unknown topic preset '{}'", key));
    }
    match (topic, subject) {
        (Some(topic), Some(subject)) if !topic.trim().is_empty() && !subject.trim().is_empty() => {
            Ok(Topic::new(topic.trim(), subject.trim()))
        }
        (None, None) => Ok(prompt::default_topic()),
        _ => Err(anyhow!("`init` needs both `topic` and `subject`, or neither")),
    }
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A conversation session is ready for the given lesson.
    Initialized { topic: String, subject: String },
    /// A message was appended to the transcript.
    Message { message: Message },
    AwaitingResponse { awaiting: bool },
    RateLimited { retry_in_ms: u64 },
    InputRejected { reason: String },
    /// A clip change for the avatar renderer.
    Animation { effect: AnimationEffect },
    AvatarPosition { vertical_position: f32 },
    EvaluationStarted,
    Evaluation { result: EvaluationResult },
    EvaluationFailed { message: String },
    SessionFailed { message: String },
    ConversationReset,
    /// Reports an error to the client.
    Error { message: String },
}

impl From<UiEvent> for ServerMessage {
    fn from(event: UiEvent) -> Self {
        match event {
            UiEvent::MessageAppended(message) => ServerMessage::Message { message },
            UiEvent::AwaitingResponse(awaiting) => ServerMessage::AwaitingResponse { awaiting },
            UiEvent::SessionReady(topic) => ServerMessage::Initialized {
                topic: topic.topic,
                subject: topic.subject,
            },
            UiEvent::SessionFailed(message) => ServerMessage::SessionFailed { message },
            UiEvent::RateLimited { retry_in } => ServerMessage::RateLimited {
                retry_in_ms: retry_in.as_millis().try_into().unwrap_or(u64::MAX),
            },
            UiEvent::InputRejected(reason) => ServerMessage::InputRejected { reason },
            UiEvent::Animation(AnimationEffect::Reposition { vertical_position }) => {
                ServerMessage::AvatarPosition { vertical_position }
            }
            UiEvent::Animation(effect) => ServerMessage::Animation { effect },
            UiEvent::EvaluationStarted => ServerMessage::EvaluationStarted,
            UiEvent::EvaluationUpdated(result) => ServerMessage::Evaluation { result },
            UiEvent::EvaluationFailed(message) => ServerMessage::EvaluationFailed { message },
            UiEvent::ConversationReset => ServerMessage::ConversationReset,
            UiEvent::Error(message) => ServerMessage::Error { message },
        }
    }
}
