//! JSON codec for coplan envelopes.
//!
//! Frames are single JSON objects carried in WebSocket text frames. Decoding
//! is done in two steps so that an unrecognized `type` can be told apart from
//! a malformed frame: the former gets an informational reply, the latter an
//! error reply.

use serde_json::Value;
use thiserror::Error;

use crate::envelope::{ClientEvent, ServerEvent};

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Frame is not valid UTF-8.
    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    /// Frame is not a JSON document.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame has no string `type` field.
    #[error("Missing message type")]
    MissingType,

    /// Frame has a known type but the wrong fields.
    #[error("Invalid {kind} message: {reason}")]
    Invalid {
        /// The frame's type tag.
        kind: String,
        /// Why the fields were rejected.
        reason: String,
    },
}

/// Result of decoding an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A recognized client event.
    Event(ClientEvent),
    /// A well-formed frame with a type this server does not handle.
    Unknown(String),
}

/// Decode an inbound text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large, is not JSON, lacks a `type`,
/// or carries invalid fields for its type.
pub fn decode(text: &str) -> Result<Decoded, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    if !ClientEvent::TYPES.contains(&kind.as_str()) {
        return Ok(Decoded::Unknown(kind));
    }

    serde_json::from_value(value)
        .map(Decoded::Event)
        .map_err(|e| ProtocolError::Invalid {
            kind,
            reason: e.to_string(),
        })
}

/// Decode an inbound binary frame, which must hold UTF-8 JSON.
///
/// # Errors
///
/// Returns an error if the bytes are not UTF-8 or fail [`decode`].
pub fn decode_bytes(data: &[u8]) -> Result<Decoded, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
    decode(text)
}

/// Encode an outbound event to a text frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode(event: &ServerEvent) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Encode a client event to a text frame. Used by clients and tests.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_client(event: &ClientEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an outbound frame. Used by clients and tests.
///
/// # Errors
///
/// Returns an error if the text is not a valid server event.
pub fn decode_server(text: &str) -> Result<ServerEvent, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
