pub mod action;
pub mod animation;
pub mod coordinator;
pub mod evaluation;
pub mod llm_client;
pub mod models;
pub mod prompt;
pub mod rate_limit;
pub mod session;
pub mod stream;

use std::time::Duration;

/// Notifications the coordinator issues to the presentation layer.
///
/// This enum is the boundary between the conversation core and whatever
/// renders it (a WebSocket client, a test harness). The core never touches
/// the view directly.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// A message was added to the transcript.
    MessageAppended(models::Message),
    /// Whether an avatar reply is pending.
    AwaitingResponse(bool),
    SessionReady(models::Topic),
    SessionFailed(String),
    RateLimited { retry_in: Duration },
    InputRejected(String),
    /// An effect for the avatar renderer.
    Animation(animation::AnimationEffect),
    EvaluationStarted,
    EvaluationUpdated(evaluation::EvaluationResult),
    EvaluationFailed(String),
    /// The transcript and evaluation were cleared.
    ConversationReset,
    /// A non-fatal failure the user should hear about.
    Error(String),
}
