//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, static sign clips and OpenAPI
//! documentation.

use crate::{
    handlers,
    models::{
        ErrorResponse, HealthResponse, RebuildResponse, ResolvePayload, SessionStatus,
        SessionSummary, SignListResponse, SignSequence,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::services::ServeDir;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_sessions,
        handlers::get_session,
        handlers::list_signs,
        handlers::resolve_signs,
        handlers::rebuild_signs,
    ),
    components(
        schemas(HealthResponse, SessionSummary, SessionStatus, SignListResponse, ResolvePayload, SignSequence, RebuildResponse, ErrorResponse)
    ),
    tags(
        (name = "SignBridge API", description = "Sign lookup and realtime session inspection")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let signs_dir = app_state.config.signs_dir.clone();
    let signs_url_prefix = app_state.config.signs_url_prefix.clone();

    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/signs", get(handlers::list_signs))
        .route("/signs/resolve", post(handlers::resolve_signs))
        .route("/signs/rebuild", post(handlers::rebuild_signs))
        .route("/ws", get(ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Merge the stateful routes with the stateless ones (Swagger UI, clips).
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest_service(&signs_url_prefix, ServeDir::new(signs_dir))
        .merge(api_router)
}
