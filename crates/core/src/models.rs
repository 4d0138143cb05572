//! Conversation Data Model
//!
//! Messages exchanged between the human teacher and the avatar, the
//! in-memory transcript that owns them, and the snapshot format sent to the
//! scoring service.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender label attached to human messages.
pub const USER_SENDER: &str = "You";

/// A configurable lesson: what the avatar is learning and in which subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub topic: String,
    pub subject: String,
}

impl Topic {
    pub fn new(topic: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subject: subject.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u64,
    pub sender: String,
    pub content: String,
    pub is_user: bool,
    pub timestamp: DateTime<Utc>,
}

/// The messages of the current session, in order.
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: Vec<Message>,
    next_id: u64,
}

impl Default for Transcript {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            next_id: 1,
        }
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> &Message {
        self.push(USER_SENDER.to_string(), content.into(), true)
    }

    pub fn push_avatar(&mut self, sender: &str, content: impl Into<String>) -> &Message {
        self.push(sender.to_string(), content.into(), false)
    }

    fn push(&mut self, sender: String, content: String, is_user: bool) -> &Message {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(Message {
            id,
            sender,
            content,
            is_user,
            timestamp: Utc::now(),
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_user_message(&self) -> bool {
        self.messages.iter().any(|m| m.is_user)
    }

    /// Drops every message and restarts ids at 1.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.next_id = 1;
    }
}

/// One transcript line in the scoring service's input format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub sender: String,
    pub content: String,
    #[serde(rename = "isUser")]
    pub is_user: bool,
}

impl From<&Message> for TranscriptEntry {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.to_string(),
            sender: msg.sender.clone(),
            content: msg.content.clone(),
            is_user: msg.is_user,
        }
    }
}

/// A freshly built, never persisted view of the conversation for scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSnapshot {
    pub session_id: String,
    pub timestamp: String,
    pub topic: String,
    pub subject: String,
    pub transcript: Vec<TranscriptEntry>,
}

impl TranscriptSnapshot {
    pub fn new(messages: &[Message], topic: &Topic) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            topic: topic.topic.clone(),
            subject: topic.subject.clone(),
            transcript: messages.iter().map(TranscriptEntry::from).collect(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
