use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one client connection for its whole lifetime.
pub type SessionId = Uuid;

/// The raw answer a recognition provider gives for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// Confidence forced into `[0, 1]`. Providers are not trusted to stay in
    /// range, and `NaN` is treated as no confidence at all.
    pub fn clamped_confidence(&self) -> f32 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }
}

/// A recognized sign for one frame, ready to be delivered to its session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationResult {
    pub session_id: SessionId,
    pub frame_sequence_number: u64,
    pub label: String,
    pub confidence: f32,
}

impl TranslationResult {
    pub fn from_prediction(
        session_id: SessionId,
        frame_sequence_number: u64,
        prediction: Prediction,
    ) -> Self {
        let confidence = prediction.clamped_confidence();
        Self {
            session_id,
            frame_sequence_number,
            label: prediction.label,
            confidence,
        }
    }
}
