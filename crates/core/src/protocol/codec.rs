//! JSON text-frame codec for application payloads

use crate::error::{CoreError, Result};
use crate::types::TransportId;
use serde_json::Value;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame codec for serialization/deserialization
pub struct MessageCodec;

impl MessageCodec {
    /// Encode a payload as one JSON text frame
    pub fn encode(payload: &Value) -> Result<String> {
        let frame = serde_json::to_string(payload)?;

        // Limit frame size
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CoreError::MessageTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(frame)
    }

    /// Decode one inbound text frame
    pub fn decode(frame: &str) -> Result<Value> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CoreError::MessageTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        serde_json::from_str(frame)
            .map_err(|e| CoreError::InvalidMessageFormat(e.to_string()))
    }

    /// First frame of every physical connection: the raw identity, not JSON
    pub fn handshake(id: &TransportId) -> String {
        id.to_string()
    }
}
