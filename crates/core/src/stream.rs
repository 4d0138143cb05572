//! Streaming Turn Accumulation
//!
//! The conversation service delivers an avatar turn as a series of text
//! fragments closed by an event carrying a stop reason. [`StreamAccumulator`]
//! buffers one turn at a time and hands back the finished text.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A raw event as delivered by the conversation service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Present only on the event that ends a turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl ConversationEvent {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            stop_reason: None,
        }
    }

    pub fn terminal(stop_reason: impl Into<String>) -> Self {
        Self {
            text: None,
            stop_reason: Some(stop_reason.into()),
        }
    }

    /// Splits the raw event into the tagged events the accumulator consumes.
    /// Text carried on a terminal event is delivered before the terminal.
    pub fn into_stream_events(self) -> Vec<StreamEvent> {
        let mut events = Vec::with_capacity(2);
        if let Some(text) = self.text.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::Fragment(text));
        }
        if let Some(stop_reason) = self.stop_reason {
            events.push(StreamEvent::Terminal { stop_reason });
        }
        events
    }
}

/// The ordered, tagged events of one session's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Terminal { stop_reason: String },
    Error(String),
}

/// What the accumulator concluded after consuming one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The turn is still accumulating.
    Pending,
    /// The turn finished with this exact text.
    Finalized(String),
    /// The turn finished blank and was dropped.
    Discarded,
    /// The stream reported an error; the partial turn was dropped.
    Failed(String),
}

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    buffer: String,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fragment(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Closes the current turn, leaving the buffer empty for the next one.
    /// Returns `None` when the turn was blank.
    pub fn on_terminal(&mut self) -> Option<String> {
        let message = std::mem::take(&mut self.buffer);
        if message.trim().is_empty() {
            None
        } else {
            Some(message)
        }
    }

    pub fn apply(&mut self, event: StreamEvent) -> TurnOutcome {
        match event {
            StreamEvent::Fragment(text) => {
                self.on_fragment(&text);
                TurnOutcome::Pending
            }
            StreamEvent::Terminal { stop_reason } => match self.on_terminal() {
                Some(message) => {
                    debug!(%stop_reason, len = message.len(), "Avatar turn finalized");
                    TurnOutcome::Finalized(message)
                }
                None => {
                    warn!(%stop_reason, "Discarding empty avatar turn");
                    TurnOutcome::Discarded
                }
            },
            StreamEvent::Error(error) => {
                self.reset();
                TurnOutcome::Failed(error)
            }
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(acc: &mut StreamAccumulator, fragments: &[&str]) {
        for f in fragments {
            assert_eq!(acc.apply(StreamEvent::Fragment(f.to_string())), TurnOutcome::Pending);
        }
    }

    fn terminal() -> StreamEvent {
        StreamEvent::Terminal {
            stop_reason: "end_turn".to_string(),
        }
    }

    #[test]
    fn test_finalized_message_is_exact_concatenation() {
        let fragments = ["{idle} ", "That ", "makes sense. ", "Why direction?"];
        let mut acc = StreamAccumulator::new();
        feed(&mut acc, &fragments);

        assert_eq!(
            acc.apply(terminal()),
            TurnOutcome::Finalized(fragments.concat())
        );
        assert_eq!(acc.buffered(), "");
    }

    #[test]
    fn test_whitespace_is_preserved() {
        let mut acc = StreamAccumulator::new();
        feed(&mut acc, &["  a", "\n", "b  "]);
        assert_eq!(acc.apply(terminal()), TurnOutcome::Finalized("  a\nb  ".to_string()));
    }

    #[test]
    fn test_blank_turn_is_discarded() {
        let mut acc = StreamAccumulator::new();
        feed(&mut acc, &[" ", "\n\t", ""]);
        assert_eq!(acc.apply(terminal()), TurnOutcome::Discarded);
        assert_eq!(acc.buffered(), "");

        assert_eq!(acc.apply(terminal()), TurnOutcome::Discarded);
    }

    #[test]
    fn test_consecutive_turns_do_not_bleed() {
        let mut acc = StreamAccumulator::new();
        feed(&mut acc, &["first"]);
        assert_eq!(acc.apply(terminal()), TurnOutcome::Finalized("first".to_string()));
        feed(&mut acc, &["second"]);
        assert_eq!(acc.apply(terminal()), TurnOutcome::Finalized("second".to_string()));
    }

    #[test]
    fn test_error_drops_partial_turn() {
        let mut acc = StreamAccumulator::new();
        feed(&mut acc, &["half a "]);
        assert_eq!(
            acc.apply(StreamEvent::Error("ThrottlingException".to_string())),
            TurnOutcome::Failed("ThrottlingException".to_string())
        );
        feed(&mut acc, &["fresh"]);
        assert_eq!(acc.apply(terminal()), TurnOutcome::Finalized("fresh".to_string()));
    }

    #[test]
    fn test_raw_event_splitting() {
        assert_eq!(
            ConversationEvent::fragment("hi").into_stream_events(),
            vec![StreamEvent::Fragment("hi".to_string())]
        );
        assert_eq!(
            ConversationEvent {
                text: Some("tail".to_string()),
                stop_reason: Some("end_turn".to_string()),
            }
            .into_stream_events(),
            vec![
                StreamEvent::Fragment("tail".to_string()),
                StreamEvent::Terminal {
                    stop_reason: "end_turn".to_string()
                },
            ]
        );
        assert!(ConversationEvent::default().into_stream_events().is_empty());
    }

    #[test]
    fn test_raw_event_wire_shape() {
        let event: ConversationEvent =
            serde_json::from_str(r#"{"stopReason":"end_turn"}"#).unwrap();
        assert_eq!(event, ConversationEvent::terminal("end_turn"));

        let json = serde_json::to_string(&ConversationEvent::fragment("x")).unwrap();
        assert_eq!(json, r#"{"text":"x"}"#);
    }
}
