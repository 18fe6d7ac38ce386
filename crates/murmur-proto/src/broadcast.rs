//! CBOR-encoded broadcast events.
//!
//! The realtime transport carries named events. The event name already
//! identifies the payload type, so we serialize only the inner struct (no
//! variant tag), the same way frame payloads are keyed by opcode.
//!
//! # Invariants
//!
//! Each [`Broadcast`] variant maps to exactly one [`EventKind`] (enforced by
//! match exhaustiveness). Decoding a payload with the kind it was encoded
//! under yields an equal value.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    ConversationId, MessageId, UserId,
    errors::{ProtocolError, Result},
};

/// Largest payload accepted by [`Broadcast::decode`].
///
/// A read receipt for a few hundred message IDs is well under this.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Broadcast event names understood by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Typing started/stopped
    Typing,
    /// Batch of messages read
    ReadReceipt,
}

impl EventKind {
    /// Wire event name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Typing => "typing",
            Self::ReadReceipt => "read_receipt",
        }
    }

    /// Parse a wire event name.
    pub fn from_event_name(name: &str) -> Result<Self> {
        match name {
            "typing" => Ok(Self::Typing),
            "read_receipt" => Ok(Self::ReadReceipt),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// A user started or stopped typing in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStatus {
    /// User whose typing state changed
    pub user_id: UserId,
    /// Conversation the user is typing in
    #[serde(rename = "chat_id")]
    pub conversation_id: ConversationId,
    /// `true` for "start typing", `false` for "stop typing"
    pub is_typing: bool,
    /// Unix milliseconds when the signal was produced
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

/// A user read a batch of messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptEvent {
    /// Conversation the messages belong to
    #[serde(rename = "chat_id")]
    pub conversation_id: ConversationId,
    /// Reader
    pub user_id: UserId,
    /// Messages read, without duplicates
    pub message_ids: Vec<MessageId>,
    /// Unix milliseconds when the batch was flushed
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

/// All broadcast payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    /// Typing indicator
    Typing(TypingStatus),
    /// Read receipt batch
    ReadReceipt(ReadReceiptEvent),
}

impl Broadcast {
    /// Event kind for this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Typing(_) => EventKind::Typing,
            Self::ReadReceipt(_) => EventKind::ReadReceipt,
        }
    }

    /// Conversation this payload belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Typing(status) => &status.conversation_id,
            Self::ReadReceipt(event) => &event.conversation_id,
        }
    }

    /// User who produced this payload.
    pub fn user_id(&self) -> &UserId {
        match self {
            Self::Typing(status) => &status.user_id,
            Self::ReadReceipt(event) => &event.user_id,
        }
    }

    /// Encode the inner payload to CBOR.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self) -> Result<Bytes> {
        let mut writer = BytesMut::new().writer();

        match self {
            Self::Typing(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ReadReceipt(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;

        Ok(writer.into_inner().freeze())
    }

    /// Decode a payload received under the given event kind.
    ///
    /// The size check happens before CBOR parsing so oversized payloads are
    /// never handed to the parser.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if `bytes` exceeds
    ///   [`MAX_PAYLOAD_SIZE`]
    /// - `ProtocolError::CborDecode` if deserialization fails
    pub fn decode(kind: EventKind, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size: bytes.len(), max: MAX_PAYLOAD_SIZE });
        }

        let payload = match kind {
            EventKind::Typing => Self::Typing(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            EventKind::ReadReceipt => Self::ReadReceipt(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
        };

        Ok(payload)
    }
}
