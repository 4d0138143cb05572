//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the service
//! clients and settings every WebSocket conversation is built from.

use crate::config::Config;
use darwin_core::coordinator::{CoordinatorSettings, DEFAULT_FRAME_INTERVAL};
use darwin_core::evaluation::EvaluationService;
use darwin_core::prompt::{DEFAULT_ANALYZER_PROMPT, DEFAULT_PERSONA_PROMPT};
use darwin_core::session::ConversationService;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// System prompts, loaded from `.md` files with built-in fallbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prompts {
    pub persona: String,
    pub analyzer: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            persona: DEFAULT_PERSONA_PROMPT.to_string(),
            analyzer: DEFAULT_ANALYZER_PROMPT.to_string(),
        }
    }
}

impl Prompts {
    /// Picks `persona` and `analyzer` out of prompts keyed by file stem.
    pub fn from_files(mut files: HashMap<String, String>) -> Self {
        let mut take = |key: &str, fallback: &str| match files.remove(key) {
            Some(content) if !content.trim().is_empty() => {
                info!(prompt = key, "Using prompt from file");
                content.trim().to_string()
            }
            _ => fallback.to_string(),
        };
        Self {
            persona: take("persona", DEFAULT_PERSONA_PROMPT),
            analyzer: take("analyzer", DEFAULT_ANALYZER_PROMPT),
        }
    }
}

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub conversation_service: Arc<dyn ConversationService>,
    pub evaluation_service: Arc<dyn EvaluationService>,
    pub persona_prompt: Arc<String>,
    pub avatar_name: String,
    pub rate_limit: Duration,
    pub evaluation_delay: Duration,
}

impl AppState {
    pub fn new(
        config: &Config,
        conversation_service: Arc<dyn ConversationService>,
        evaluation_service: Arc<dyn EvaluationService>,
        persona_prompt: String,
    ) -> Self {
        Self {
            conversation_service,
            evaluation_service,
            persona_prompt: Arc::new(persona_prompt),
            avatar_name: config.avatar_name.clone(),
            rate_limit: config.rate_limit,
            evaluation_delay: config.evaluation_delay,
        }
    }

    /// Settings for a new per-connection coordinator.
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            avatar_name: self.avatar_name.clone(),
            persona_prompt: self.persona_prompt.clone(),
            min_send_interval: self.rate_limit,
            evaluation_delay: self.evaluation_delay,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            ..Default::default()
        }
    }
}
