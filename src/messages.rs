//! # Wire Protocol Messages
//!
//! This module defines the framed record exchanged between peers. Records
//! are BSON documents streamed back-to-back over one bidirectional QUIC
//! stream per logical peer pairing; a document's leading little-endian
//! length makes the stream self-delimiting.
//!
//! ## Record Layout
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `recipient` | Fingerprint of the final destination peer |
//! | `ttl` | Remaining hop budget; forwarding decrements it |
//! | `code` | `Command`, `Entity`, or `Application` |
//! | `payload` | Opaque bytes interpreted per code |
//!
//! ## Security Limits
//!
//! Decoding enforces `MAX_WIRE_MESSAGE`: a record whose declared length
//! exceeds it is a protocol violation and tears down the receiving stream.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Maximum size of one wire record (1 MiB plus framing headroom).
/// SECURITY: Prevents memory exhaustion from hostile length prefixes.
pub const MAX_WIRE_MESSAGE: usize = 1024 * 1024 + 4096;

/// Smallest possible BSON document (length prefix + terminator).
pub const MIN_WIRE_MESSAGE: usize = 5;

/// Payload of the periodic keepalive command.
pub const COMMAND_PING: &[u8] = b"PING";

/// Protocol code of a wire record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageCode {
    /// Session control; unknown commands are accepted and ignored.
    Command,
    /// Carries a signed cookie (key exchange).
    Entity,
    /// End-to-end encrypted application payload (SIP bytes).
    Application,
}

/// One framed overlay record.
///
/// Messages are value types: forwarding never mutates in place but emits a
/// copy with a decremented TTL via [`Message::forwarded`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub recipient: PeerId,
    pub ttl: i32,
    pub code: MessageCode,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(recipient: PeerId, ttl: i32, code: MessageCode, payload: Vec<u8>) -> Self {
        Self {
            recipient,
            ttl,
            code,
            payload,
        }
    }

    /// The keepalive record sent every five seconds per neighbor stream.
    pub fn ping(recipient: PeerId) -> Self {
        Self::new(recipient, 0, MessageCode::Command, COMMAND_PING.to_vec())
    }

    /// Copy of this message with the hop budget spent for one forward.
    pub fn forwarded(&self) -> Self {
        let mut copy = self.clone();
        copy.ttl -= 1;
        copy
    }

    /// Copy of this message readdressed to another peer.
    pub fn readdressed(&self, recipient: PeerId) -> Self {
        let mut copy = self.clone();
        copy.recipient = recipient;
        copy
    }
}

/// Error type for wire encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode record: {0}")]
    Encode(#[from] bson::ser::Error),
    #[error("failed to decode record: {0}")]
    Decode(#[from] bson::de::Error),
    #[error("record of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },
    #[error("record header is malformed")]
    BadHeader,
}

/// Encode one record as a BSON document.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, WireError> {
    Ok(bson::to_vec(message)?)
}

/// Decode one record from a complete BSON document.
pub fn decode_message(bytes: &[u8]) -> Result<Message, WireError> {
    if bytes.len() > MAX_WIRE_MESSAGE {
        return Err(WireError::Oversized {
            len: bytes.len(),
            max: MAX_WIRE_MESSAGE,
        });
    }
    Ok(bson::from_slice(bytes)?)
}

/// Parse the document length out of a BSON header.
///
/// Returns the total record length (the prefix counts itself), validated
/// against the wire limits.
pub fn record_len(header: &[u8; 4]) -> Result<usize, WireError> {
    let len = i32::from_le_bytes(*header);
    if len < MIN_WIRE_MESSAGE as i32 {
        return Err(WireError::BadHeader);
    }
    let len = len as usize;
    if len > MAX_WIRE_MESSAGE {
        return Err(WireError::Oversized {
            len,
            max: MAX_WIRE_MESSAGE,
        });
    }
    Ok(len)
}
