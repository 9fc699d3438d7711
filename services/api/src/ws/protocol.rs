//! Defines the WebSocket message protocol between the browser client and the API server.

use serde::{Deserialize, Serialize};
use signbridge_core::types::TranslationResult;
use uuid::Uuid;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Text to translate into a sequence of sign clips.
    TextToSign { text: String },
    /// One camera frame as a `data:image/...;base64,...` URL.
    VideoFrame { data: String },
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when the connection is accepted.
    Connected { session_id: Uuid },
    /// Clip URLs for a `text_to_sign` request, in word order. May be empty.
    SignVideoSequence { videos: Vec<String> },
    /// The recognised sign for one earlier `video_frame`.
    Translation {
        label: String,
        confidence: f32,
        sequence: u64,
    },
}

impl From<TranslationResult> for ServerMessage {
    fn from(result: TranslationResult) -> Self {
        ServerMessage::Translation {
            label: result.label,
            confidence: result.confidence,
            sequence: result.frame_sequence_number,
        }
    }
}
