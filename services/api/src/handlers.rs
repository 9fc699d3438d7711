//! Axum Handlers for the REST API
//!
//! Health, session inspection and sign-index endpoints. The realtime
//! protocol lives in `ws`; these exist for operators and for clients that only
//! need text-to-sign lookups. `utoipa` doc comments generate the OpenAPI
//! documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    models::{
        ErrorResponse, HealthResponse, RebuildResponse, ResolvePayload, SessionSummary,
        SignListResponse, SignSequence,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
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
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Report liveness and current load.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.sessions.count(),
        in_flight_inferences: state.dispatcher.in_flight(),
        indexed_signs: state.sign_index.load().len(),
    })
}

/// List all live realtime sessions.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Live sessions, oldest first", body = [SessionSummary])
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    Json(
        state
            .sessions
            .snapshots()
            .into_iter()
            .map(SessionSummary::from)
            .collect(),
    )
}

/// Get a specific live session by its ID.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SessionSummary),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSummary>, ApiError> {
    let snapshot = state
        .sessions
        .snapshot(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Session with id '{}' not found", id)))?;
    Ok(Json(snapshot.into()))
}

/// List every word that has a sign clip.
#[utoipa::path(
    get,
    path = "/signs",
    responses(
        (status = 200, description = "Indexed words, sorted", body = SignListResponse)
    )
)]
pub async fn list_signs(State(state): State<Arc<AppState>>) -> Json<SignListResponse> {
    let index = state.sign_index.load();
    Json(SignListResponse {
        signs: index.words().into_iter().map(str::to_owned).collect(),
    })
}

/// Resolve text to an ordered list of sign clip URLs.
#[utoipa::path(
    post,
    path = "/signs/resolve",
    request_body = ResolvePayload,
    responses(
        (status = 200, description = "Clip URLs in word order; empty if nothing matched", body = SignSequence),
        (status = 400, description = "Blank text", body = ErrorResponse)
    )
)]
pub async fn resolve_signs(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ResolvePayload>,
) -> Result<Json<SignSequence>, ApiError> {
    if payload.text.trim().is_empty() {
        return Err(ApiError::BadRequest("`text` must not be blank".to_string()));
    }
    Ok(Json(SignSequence {
        videos: state.sign_index.load().resolve_urls(&payload.text),
    }))
}

/// Rescan the sign asset directory and swap in the new index.
#[utoipa::path(
    post,
    path = "/signs/rebuild",
    responses(
        (status = 200, description = "Index rebuilt", body = RebuildResponse),
        (status = 500, description = "Asset directory could not be read", body = ErrorResponse)
    )
)]
pub async fn rebuild_signs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RebuildResponse>, ApiError> {
    let current = state.sign_index.load_full();
    let rebuilt = tokio::task::spawn_blocking(move || current.rebuild()).await??;
    let indexed_signs = rebuilt.len();
    state.sign_index.store(Arc::new(rebuilt));
    info!(indexed_signs, "Sign index rebuilt");
    Ok(Json(RebuildResponse { indexed_signs }))
}
