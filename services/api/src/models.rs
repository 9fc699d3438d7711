//! API Models
//!
//! Request and response bodies for the REST endpoints, annotated with
//! `utoipa` so they show up in the generated OpenAPI document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signbridge_core::session::{SessionSnapshot, SessionState};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Active,
    Disconnected,
}

impl From<SessionState> for SessionStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Connected => SessionStatus::Connected,
            SessionState::Active => SessionStatus::Active,
            SessionState::Disconnected => SessionStatus::Disconnected,
        }
    }
}

/// A live realtime session as seen from outside.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionSummary {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[schema(value_type = String, example = "active")]
    pub status: SessionStatus,
    pub last_frame_seq: u64,
    pub in_flight_inferences: usize,
    pub dropped_frames: u64,
}

impl From<SessionSnapshot> for SessionSummary {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            id: snapshot.id,
            created_at: snapshot.created_at,
            status: snapshot.state.into(),
            last_frame_seq: snapshot.last_frame_seq,
            in_flight_inferences: snapshot.in_flight_inferences,
            dropped_frames: snapshot.dropped_frames,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub active_sessions: usize,
    pub in_flight_inferences: usize,
    pub indexed_signs: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct SignListResponse {
    pub signs: Vec<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct ResolvePayload {
    #[schema(example = "Hello, World!")]
    pub text: String,
}

/// Ordered clip URLs, one per recognised word.
#[derive(Serialize, Deserialize, ToSchema, Debug, PartialEq)]
pub struct SignSequence {
    pub videos: Vec<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct RebuildResponse {
    pub indexed_signs: usize,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
