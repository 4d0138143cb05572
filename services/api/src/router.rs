//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{ErrorResponse, TopicPresetResponse},
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::list_topics,
        handlers::search_topics,
        handlers::get_topic,
    ),
    components(
        schemas(TopicPresetResponse, ErrorResponse)
    ),
    tags(
        (name = "Darwin API", description = "Topic presets for the Darwin tutoring avatar")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/topics", get(handlers::list_topics))
        .route("/topics/search", get(handlers::search_topics))
        .route("/topics/{key}", get(handlers::get_topic))
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_topic_paths() {
        let doc = ApiDoc::openapi();
        for path in ["/topics", "/topics/search", "/topics/{key}"] {
            assert!(doc.paths.paths.contains_key(path), "missing {}", path);
        }
    }
}
