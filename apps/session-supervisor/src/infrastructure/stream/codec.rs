//! Stream Codec
//!
//! Encoding of client control messages and decoding of server frames.
//!
//! # Client Messages (JSON text)
//!
//! ```json
//! {"a": "subscribe",   "v": [408065, 884737]}
//! {"a": "mode",        "v": ["full", [408065]]}
//! {"a": "unsubscribe", "v": [408065]}
//! ```
//!
//! # Server Binary Frames
//!
//! ```text
//! ┌──────────┬──────────┬───────────────┬──────────┬───────────────┬───
//! │ count u16│ len u16  │ packet (len)  │ len u16  │ packet (len)  │ ...
//! └──────────┴──────────┴───────────────┴──────────┴───────────────┴───
//! ```
//!
//! All integers are big-endian. The first four bytes of each packet are the
//! instrument token. Packets are forwarded undecoded. A single-byte frame is
//! a server heartbeat.
//!
//! # Server Text Frames
//!
//! JSON objects of the form `{"type": "...", "data": ...}`. Only `error`
//! is acted upon.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::application::ports::Tick;
use crate::domain::subscription::{InstrumentId, SubscriptionMode};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame shorter than its header claims.
    #[error("truncated frame: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        /// Offset the read started at.
        offset: usize,
        /// Bytes required.
        needed: usize,
        /// Bytes remaining.
        available: usize,
    },

    /// Packet too short to carry an instrument token.
    #[error("packet of {0} bytes has no instrument token")]
    PacketTooShort(usize),

    /// Zero-length frame.
    #[error("empty frame")]
    EmptyFrame,
}

// =============================================================================
// Client Requests
// =============================================================================

/// Control message sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Start streaming instruments.
    Subscribe(Vec<InstrumentId>),
    /// Set the mode for instruments.
    Mode(SubscriptionMode, Vec<InstrumentId>),
    /// Stop streaming instruments.
    Unsubscribe(Vec<InstrumentId>),
}

impl ControlRequest {
    /// Encode as a JSON text message.
    #[must_use]
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Subscribe(ids) => json!({ "a": "subscribe", "v": tokens(ids) }),
            Self::Mode(mode, ids) => json!({ "a": "mode", "v": [mode.as_str(), tokens(ids)] }),
            Self::Unsubscribe(ids) => json!({ "a": "unsubscribe", "v": tokens(ids) }),
        };
        value.to_string()
    }
}

// =============================================================================
// Server Frames
// =============================================================================

/// Decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryFrame {
    /// Server keep-alive.
    Heartbeat,
    /// Market data packets.
    Ticks(Vec<Tick>),
}

/// Decoded text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextFrame {
    /// Server-reported error.
    Error(String),
    /// Any other message type, ignored by the supervisor.
    Other(String),
}

#[derive(Debug, Deserialize)]
struct RawTextFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decode a binary frame.
///
/// # Errors
///
/// Returns `CodecError` if the frame is empty or its lengths are
/// inconsistent with its size.
pub fn decode_binary(data: &[u8], received_at: DateTime<Utc>) -> Result<BinaryFrame, CodecError> {
    match data.len() {
        0 => return Err(CodecError::EmptyFrame),
        1 => return Ok(BinaryFrame::Heartbeat),
        _ => {}
    }

    let count = usize::from(read_u16(data, 0)?);
    let mut offset = 2;
    let mut ticks = Vec::with_capacity(count);

    for _ in 0..count {
        let len = usize::from(read_u16(data, offset)?);
        offset += 2;

        let packet = data
            .get(offset..offset + len)
            .ok_or(CodecError::Truncated {
                offset,
                needed: len,
                available: data.len().saturating_sub(offset),
            })?;
        offset += len;

        let token: [u8; 4] = packet
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(CodecError::PacketTooShort(len))?;

        ticks.push(Tick {
            instrument: InstrumentId::new(u32::from_be_bytes(token)),
            payload: packet.to_vec(),
            received_at,
        });
    }

    Ok(BinaryFrame::Ticks(ticks))
}

/// Decode a text frame.
///
/// # Errors
///
/// Returns `CodecError::Json` if the text is not a typed JSON object.
pub fn decode_text(text: &str) -> Result<TextFrame, CodecError> {
    let raw: RawTextFrame = serde_json::from_str(text)?;

    if raw.kind == "error" {
        let message = match raw.data {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        return Ok(TextFrame::Error(message));
    }

    Ok(TextFrame::Other(raw.kind))
}

fn tokens(ids: &[InstrumentId]) -> Vec<u32> {
    ids.iter().map(|id| id.value()).collect()
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, CodecError> {
    data.get(offset..offset + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_be_bytes)
        .ok_or(CodecError::Truncated {
            offset,
            needed: 2,
            available: data.len().saturating_sub(offset),
        })
}

// =============================================================================
// Tests
// =============================================================================
