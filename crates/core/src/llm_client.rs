//! OpenAI-compatible implementations of the conversation and scoring
//! services. Both work against any endpoint speaking the chat completions
//! API (OpenAI itself, or Gemini's compatibility layer).

use crate::evaluation::{EvaluationResult, EvaluationService, RawEvaluation};
use crate::session::{ChatSession, ConversationService, EventStream};
use crate::stream::ConversationEvent;
use anyhow::{Context, Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, FinishReason, ResponseFormat, ResponseFormatJsonSchema,
    },
};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

type EventSender = mpsc::UnboundedSender<Result<ConversationEvent>>;

/// Stop reason reported when the stream ends without one.
const FALLBACK_STOP_REASON: &str = "end_turn";

fn system_message(content: &str) -> Result<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestSystemMessageArgs::default()
        .content(content)
        .build()?
        .into())
}

fn user_message(content: &str) -> Result<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestUserMessageArgs::default()
        .content(content)
        .build()?
        .into())
}

fn stop_reason(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Stop => "end_turn".to_string(),
        FinishReason::Length => "max_tokens".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// Opens chat sessions against an OpenAI-compatible API.
pub struct OpenAIConversationService {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAIConversationService {
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl ConversationService for OpenAIConversationService {
    async fn create_session(&self, system_prompt: &str) -> Result<Arc<dyn ChatSession>> {
        let session =
            OpenAIChatSession::new(self.client.clone(), self.model.clone(), system_prompt)?;
        Ok(Arc::new(session))
    }
}

/// One conversation. The history lives client-side and is replayed on every
/// turn; turns are serialized by the history lock.
pub struct OpenAIChatSession {
    client: Client<OpenAIConfig>,
    model: String,
    history: tokio::sync::Mutex<Vec<ChatCompletionRequestMessage>>,
    events_tx: EventSender,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<ConversationEvent>>>>,
}

impl OpenAIChatSession {
    pub fn new(client: Client<OpenAIConfig>, model: String, system_prompt: &str) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            client,
            model,
            history: tokio::sync::Mutex::new(vec![system_message(system_prompt)?]),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    fn forward(&self, event: Result<ConversationEvent>) {
        if self.events_tx.send(event).is_err() {
            debug!("Session feed closed; dropping event");
        }
    }
}

#[async_trait]
impl ChatSession for OpenAIChatSession {
    async fn send_message(&self, text: &str) -> Result<()> {
        let mut history = self.history.lock().await;
        history.push(user_message(text)?);

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(history.clone())
            .stream(true)
            .build()?;

        let mut stream = match self.client.chat().create_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                history.pop();
                return Err(e).context("Failed to open completion stream");
            }
        };

        let mut reply = String::new();
        let mut finished = false;
        while let Some(chunk) = stream.next().await {
            let response = match chunk {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Completion stream error");
                    self.forward(Err(anyhow!(e).context("Completion stream failed")));
                    return Ok(());
                }
            };
            let Some(choice) = response.choices.first() else {
                continue;
            };
            let text = choice.delta.content.clone().filter(|t| !t.is_empty());
            if let Some(t) = &text {
                reply.push_str(t);
            }
            let stop = choice.finish_reason.as_ref().map(stop_reason);
            finished |= stop.is_some();
            if text.is_some() || stop.is_some() {
                self.forward(Ok(ConversationEvent {
                    text,
                    stop_reason: stop,
                }));
            }
            if finished {
                break;
            }
        }

        if !finished {
            self.forward(Ok(ConversationEvent::terminal(FALLBACK_STOP_REASON)));
        }
        if !reply.is_empty() {
            history.push(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(reply)
                    .build()?
                    .into(),
            );
        }
        debug!(turns = history.len(), "Completion turn finished");
        Ok(())
    }

    fn subscribe(&self) -> Result<EventStream> {
        let rx = self
            .events_rx
            .lock()
            .map_err(|_| anyhow!("Session feed lock poisoned"))?
            .take()
            .context("Session feed already subscribed")?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Scores transcripts with a structured-output completion.
pub struct OpenAIEvaluationService {
    client: Client<OpenAIConfig>,
    model: String,
    prompt: String,
}

impl OpenAIEvaluationService {
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the endpoint.
    /// * `model` - Model identifier used for scoring.
    /// * `prompt` - System prompt of the analyzer.
    pub fn new(config: OpenAIConfig, model: String, prompt: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            prompt,
        }
    }

    fn response_format() -> Result<ResponseFormat> {
        let schema = schemars::schema_for!(EvaluationResult);
        Ok(ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some("Scores for the teacher's explanations".to_string()),
                name: "evaluation".to_string(),
                schema: Some(serde_json::to_value(&schema)?),
                strict: Some(false),
            },
        })
    }
}

#[async_trait]
impl EvaluationService for OpenAIEvaluationService {
    async fn analyze(&self, transcript: &str) -> Result<RawEvaluation> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![system_message(&self.prompt)?, user_message(transcript)?])
            .response_format(Self::response_format()?)
            .build()?;

        let response = self.client.chat().create(request).await?;
        let answer = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .as_deref()
            .context("No content in LLM response")?;

        info!(len = answer.len(), "Received evaluation");
        let raw = serde_json::from_str(extract_json(answer))
            .with_context(|| format!("Evaluation is not valid JSON: {answer}"))?;
        Ok(raw)
    }
}

/// Trims anything around the outermost JSON object, such as code fences.
fn extract_json(answer: &str) -> &str {
    match (answer.find('{'), answer.rfind('}')) {
        (Some(start), Some(end)) if start < end => &answer[start..=end],
        _ => answer.trim(),
    }
}
