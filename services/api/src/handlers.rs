//! Axum Handlers for the REST API
//!
//! Read-only endpoints over the built-in topic presets. Documented with
//! `utoipa` doc comments.

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use darwin_core::prompt::{TOPIC_PRESETS, preset, search_presets};
use tracing::debug;

use crate::models::{ErrorResponse, TopicPresetResponse, TopicSearchQuery};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
        }
    }
}

/// List the preset topics.
#[utoipa::path(
    get,
    path = "/topics",
    responses(
        (status = 200, description = "All topic presets", body = [TopicPresetResponse])
    )
)]
pub async fn list_topics() -> Json<Vec<TopicPresetResponse>> {
    Json(TOPIC_PRESETS.iter().map(TopicPresetResponse::from).collect())
}

/// Search the preset topics, best match first.
#[utoipa::path(
    get,
    path = "/topics/search",
    params(TopicSearchQuery),
    responses(
        (status = 200, description = "Matching presets", body = [TopicPresetResponse]),
        (status = 400, description = "Empty query", body = ErrorResponse)
    )
)]
pub async fn search_topics(
    Query(query): Query<TopicSearchQuery>,
) -> Result<Json<Vec<TopicPresetResponse>>, ApiError> {
    let q = query.q.trim();
    if q.is_empty() {
        return Err(ApiError::BadRequest("Query parameter 'q' must not be empty".to_string()));
    }
    let matches: Vec<TopicPresetResponse> = search_presets(q)
        .into_iter()
        .map(TopicPresetResponse::from)
        .collect();
    debug!(query = q, matches = matches.len(), "Topic search");
    Ok(Json(matches))
}

/// Get one preset by key.
#[utoipa::path(
    get,
    path = "/topics/{key}",
    responses(
        (status = 200, description = "The preset", body = TopicPresetResponse),
        (status = 404, description = "Unknown preset", body = ErrorResponse)
    ),
    params(
        ("key" = String, Path, description = "Preset key, e.g. 'physics'")
    )
)]
pub async fn get_topic(Path(key): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let preset = preset(&key)
        .ok_or_else(|| ApiError::NotFound(format!("Topic preset '{}' not found", key)))?;
    Ok((StatusCode::OK, Json(TopicPresetResponse::from(preset))))
}
