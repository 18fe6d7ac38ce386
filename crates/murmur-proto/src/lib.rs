//! Broadcast payloads for the realtime synchronization core.
//!
//! Typing and read-receipt signals travel over a shared realtime transport as
//! named broadcast events. The event name identifies the payload type, and the
//! payload itself is CBOR so peers can decode it without code generation.
//!
//! # Components
//!
//! - [`ConversationId`], [`UserId`], [`MessageId`]: identifier newtypes
//! - [`TypingStatus`], [`ReadReceiptEvent`]: payload bodies
//! - [`Broadcast`]: tagged union of all payloads, with the CBOR codec
//! - [`EventKind`]: wire event names

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod broadcast;
mod errors;
mod ids;

pub use broadcast::{Broadcast, EventKind, MAX_PAYLOAD_SIZE, ReadReceiptEvent, TypingStatus};
pub use errors::{ProtocolError, Result};
pub use ids::{ConversationId, MessageId, UserId};
