//! Frame Decoding
//!
//! Turns a client's data-URL encoded still image into a BGR pixel buffer that
//! recognition providers can consume directly. Decoding is bounded: oversize
//! payloads are rejected before any work is done and the image decoder refuses
//! dimensions above the configured limit.

use crate::types::SessionId;
use base64::Engine;
use chrono::{DateTime, Utc};
use image::{ImageError, ImageFormat, ImageReader, Limits};
use serde::Serialize;
use std::io::Cursor;

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_DIMENSION: u32 = 4096;

/// Every decoded frame carries exactly this many channels.
pub const CHANNELS: u8 = 3;

/// Why a frame payload could not be turned into pixels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame payload: {reason}")]
    MalformedPayload { reason: String },
    #[error("frame exceeds decode limits: {reason}")]
    TooLarge { reason: String },
}

impl DecodeError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }
}

/// Byte order of the channels inside a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Bgr,
}

/// A row-major, 3-channel image in BGR order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wraps raw BGR bytes. Returns `None` if the length does not match the
    /// dimensions.
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        let expected = width as usize * height as usize * CHANNELS as usize;
        (data.len() == expected).then_some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        CHANNELS
    }

    pub fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Bgr
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// The `[b, g, r]` triple at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS as usize;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }
}

/// One decoded camera frame, consumed by a single inference call.
#[derive(Debug, Clone)]
pub struct Frame {
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub pixels: PixelBuffer,
    pub captured_at: DateTime<Utc>,
}

/// Validates and decodes `data:image/...;base64,...` payloads.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_payload_bytes: usize,
    max_dimension: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_DIMENSION)
    }
}

impl FrameDecoder {
    pub fn new(max_payload_bytes: usize, max_dimension: u32) -> Self {
        Self {
            max_payload_bytes,
            max_dimension,
        }
    }

    /// Decodes `payload` into a [`Frame`] stamped with the given session and
    /// sequence number.
    pub fn decode(
        &self,
        session_id: SessionId,
        sequence_number: u64,
        payload: &str,
    ) -> Result<Frame, DecodeError> {
        let pixels = self.decode_pixels(payload)?;
        Ok(Frame {
            session_id,
            sequence_number,
            pixels,
            captured_at: Utc::now(),
        })
    }

    /// Decodes `payload` into a BGR pixel buffer.
    pub fn decode_pixels(&self, payload: &str) -> Result<PixelBuffer, DecodeError> {
        if payload.len() > self.max_payload_bytes {
            return Err(DecodeError::TooLarge {
                reason: format!(
                    "payload is {} bytes, limit is {}",
                    payload.len(),
                    self.max_payload_bytes
                ),
            });
        }

        let (format, encoded) = split_data_url(payload)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| DecodeError::malformed(format!("invalid base64: {e}")))?;

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);

        let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
        reader.limits(limits);
        let image = reader.decode().map_err(|e| match e {
            ImageError::Limits(limit) => DecodeError::TooLarge {
                reason: limit.to_string(),
            },
            other => DecodeError::malformed(format!("not a valid {format:?} image: {other}")),
        })?;

        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        let mut data = rgb.into_raw();
        for pixel in data.chunks_exact_mut(CHANNELS as usize) {
            pixel.swap(0, 2);
        }

        Ok(PixelBuffer {
            width,
            height,
            data,
        })
    }
}

/// Splits a data URL into its declared image format and base64 body.
fn split_data_url(payload: &str) -> Result<(ImageFormat, &str), DecodeError> {
    let rest = payload
        .strip_prefix("data:")
        .ok_or_else(|| DecodeError::malformed("missing `data:` scheme"))?;
    let (header, body) = rest
        .split_once(',')
        .ok_or_else(|| DecodeError::malformed("missing `,` before image data"))?;

    let mut params = header.split(';');
    let media_type = params.next().unwrap_or_default().trim().to_ascii_lowercase();
    let subtype = media_type.strip_prefix("image/").ok_or_else(|| {
        DecodeError::malformed(format!("`{media_type}` is not an image media type"))
    })?;
    if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(DecodeError::malformed("image data is not base64 encoded"));
    }

    let format = match subtype {
        "jpeg" | "jpg" => ImageFormat::Jpeg,
        "png" => ImageFormat::Png,
        "webp" => ImageFormat::WebP,
        "gif" => ImageFormat::Gif,
        "bmp" => ImageFormat::Bmp,
        other => {
            return Err(DecodeError::malformed(format!(
                "unsupported image type `image/{other}`"
            )));
        }
    };

    if body.trim().is_empty() {
        return Err(DecodeError::malformed("empty image data"));
    }
    Ok((format, body))
}
