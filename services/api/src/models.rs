//! REST API Models
//!
//! Response and query types of the topic preset endpoints, documented for
//! OpenAPI with `utoipa`.

use darwin_core::prompt::TopicPreset;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// A preset lesson the avatar can be started on.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct TopicPresetResponse {
    /// Short identifier, usable as `preset` in the WebSocket `init` message.
    pub key: String,
    pub topic: String,
    pub subject: String,
}

impl From<&TopicPreset> for TopicPresetResponse {
    fn from(preset: &TopicPreset) -> Self {
        Self {
            key: preset.key.to_string(),
            topic: preset.topic.to_string(),
            subject: preset.subject.to_string(),
        }
    }
}

#[derive(Deserialize, IntoParams, Debug)]
#[into_params(parameter_in = Query)]
pub struct TopicSearchQuery {
    /// Free text matched fuzzily against key, topic and subject.
    pub q: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
