//! Per-connection session state.
//!
//! A [`Session`] moves through `Connected → Active → Disconnected` and owns
//! the session's [`DispatchLane`]. Once disconnected it never lets another
//! result through, even if the provider answers afterwards.

use crate::{
    dispatcher::{DispatchError, DispatchLane, InferenceDispatcher},
    frame::Frame,
    types::{SessionId, TranslationResult},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    Active,
    Disconnected,
}

/// A point-in-time copy of a session's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub last_frame_seq: u64,
    pub in_flight_inferences: usize,
    pub dropped_frames: u64,
}

pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    state: SessionState,
    last_frame_seq: u64,
    dropped_frames: u64,
    lane: DispatchLane,
}

impl Session {
    /// Creates a session with a fresh id and opens its dispatch lane.
    pub fn open(
        dispatcher: &InferenceDispatcher,
    ) -> (Self, mpsc::UnboundedReceiver<TranslationResult>) {
        let id = Uuid::new_v4();
        let (lane, results) = dispatcher.open_lane(id);
        let session = Self {
            id,
            created_at: Utc::now(),
            state: SessionState::Connected,
            last_frame_seq: 0,
            dropped_frames: 0,
            lane,
        };
        (session, results)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_frame_seq(&self) -> u64 {
        self.last_frame_seq
    }

    pub fn in_flight_inferences(&self) -> usize {
        self.lane.in_flight()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Marks the session as handling requests. No-op unless `Connected`.
    pub fn activate(&mut self) {
        if self.state == SessionState::Connected {
            self.state = SessionState::Active;
        }
    }

    /// Allocates the sequence number for the next inbound frame.
    pub fn next_frame_seq(&mut self) -> u64 {
        self.activate();
        self.last_frame_seq += 1;
        self.last_frame_seq
    }

    /// Submits a decoded frame for recognition. Overload rejections are
    /// counted as dropped frames.
    pub fn submit(&mut self, frame: Frame) -> Result<(), DispatchError> {
        let result = self.lane.submit(frame);
        if matches!(result, Err(DispatchError::Overloaded { .. })) {
            self.dropped_frames += 1;
        }
        result
    }

    /// Whether anything may still be sent to this session's client.
    pub fn may_emit(&self) -> bool {
        self.state != SessionState::Disconnected
    }

    /// Passes `result` through only if it belongs to this session and the
    /// session can still emit.
    pub fn accept(&self, result: TranslationResult) -> Option<TranslationResult> {
        (self.may_emit() && result.session_id == self.id).then_some(result)
    }

    /// Terminal transition. Closes the dispatch lane, which discards buffered
    /// results and releases the session's in-flight budget.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.state = SessionState::Disconnected;
        self.lane.close();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            created_at: self.created_at,
            state: self.state,
            last_frame_seq: self.last_frame_seq,
            in_flight_inferences: self.in_flight_inferences(),
            dropped_frames: self.dropped_frames,
        }
    }
}
