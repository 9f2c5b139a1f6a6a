//! Screen frames captured by the actuator and fanned out to observers.

use std::sync::OnceLock;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One captured screenshot.
///
/// Owned by the orchestrator for a single iteration and published by
/// reference (`Arc<ScreenFrame>`) to the event bus, where only the latest
/// frame is retained. The base64 transport form is computed once on demand
/// and cached, so repeated fan-out to socket subscribers does not re-encode.
#[derive(Debug)]
pub struct ScreenFrame {
    pub captured_at: DateTime<Utc>,
    pub width_px: u32,
    pub height_px: u32,
    /// JPEG-encoded image bytes as produced by the actuator.
    pub jpeg_bytes: Vec<u8>,
    base64_cache: OnceLock<String>,
}

impl ScreenFrame {
    pub fn new(width_px: u32, height_px: u32, jpeg_bytes: Vec<u8>) -> Self {
        Self {
            captured_at: Utc::now(),
            width_px,
            height_px,
            jpeg_bytes,
            base64_cache: OnceLock::new(),
        }
    }

    /// The base64 transport encoding, computed once per frame.
    pub fn to_base64(&self) -> &str {
        self.base64_cache
            .get_or_init(|| base64::engine::general_purpose::STANDARD.encode(&self.jpeg_bytes))
    }
}

impl PartialEq for ScreenFrame {
    fn eq(&self, other: &Self) -> bool {
        self.captured_at == other.captured_at
            && self.width_px == other.width_px
            && self.height_px == other.height_px
            && self.jpeg_bytes == other.jpeg_bytes
    }
}

impl Clone for ScreenFrame {
    fn clone(&self) -> Self {
        Self {
            captured_at: self.captured_at,
            width_px: self.width_px,
            height_px: self.height_px,
            jpeg_bytes: self.jpeg_bytes.clone(),
            base64_cache: OnceLock::new(),
        }
    }
}

/// Wire form used by both the socket and `GET /frame/latest`.
#[derive(Serialize, Deserialize)]
struct FrameWire {
    captured_at: DateTime<Utc>,
    width_px: u32,
    height_px: u32,
    image_base64: String,
}

impl Serialize for ScreenFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        FrameWire {
            captured_at: self.captured_at,
            width_px: self.width_px,
            height_px: self.height_px,
            image_base64: self.to_base64().to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ScreenFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = FrameWire::deserialize(deserializer)?;
        let jpeg_bytes = base64::engine::general_purpose::STANDARD
            .decode(&wire.image_base64)
            .map_err(|e| D::Error::custom(format!("invalid frame base64: {e}")))?;
        Ok(Self {
            captured_at: wire.captured_at,
            width_px: wire.width_px,
            height_px: wire.height_px,
            jpeg_bytes,
            base64_cache: OnceLock::new(),
        })
    }
}
