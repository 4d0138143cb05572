//! Action Tag Parsing
//!
//! The avatar prefixes each reply with a bracketed action token such as
//! `{eat}` describing how it should react. This module splits that token off
//! the message text and maps it onto an [`ActionTag`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phrase appended to finalized avatar messages while quack mode is on.
pub const QUACK_SUFFIX: &str = " Quack quack!";

/// The avatar reaction encoded at the start of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionTag {
    #[default]
    Idle,
    Lay,
    Eat,
}

impl ActionTag {
    /// Maps a bare token (without braces) onto an action, ignoring case.
    /// Unknown tokens fall back to [`ActionTag::Idle`].
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "lay" | "laying" => ActionTag::Lay,
            "eat" | "eating" => ActionTag::Eat,
            _ => ActionTag::Idle,
        }
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionTag::Idle => write!(f, "idle"),
            ActionTag::Lay => write!(f, "lay"),
            ActionTag::Eat => write!(f, "eat"),
        }
    }
}

/// The result of splitting a raw avatar message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub action: ActionTag,
    pub clean: String,
}

/// Splits an optional leading `{token}` off `raw`.
///
/// Any non-empty run of characters up to the first `}` counts as a token; it
/// is trimmed before lookup. The bracket and surrounding whitespace are
/// always removed, even when the token is unknown. A message without a
/// token is returned trimmed and tagged [`ActionTag::Idle`].
pub fn parse(raw: &str) -> ParsedMessage {
    let trimmed = raw.trim();

    if let Some((token, rest)) = split_token(trimmed) {
        return ParsedMessage {
            action: ActionTag::from_token(token.trim()),
            clean: rest.trim().to_string(),
        };
    }

    ParsedMessage {
        action: ActionTag::Idle,
        clean: trimmed.to_string(),
    }
}

/// Returns `(token, remainder)` when `text` starts with `{token}`.
fn split_token(text: &str) -> Option<(&str, &str)> {
    let inner = text.strip_prefix('{')?;
    let close = inner.find('}')?;
    (close > 0).then(|| (&inner[..close], &inner[close + 1..]))
}

/// Appends the quack suffix when quack mode is enabled.
pub fn decorate(clean: &str, quack_mode: bool) -> String {
    if quack_mode {
        format!("{clean}{QUACK_SUFFIX}")
    } else {
        clean.to_string()
    }
}
