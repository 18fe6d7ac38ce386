//! Read-state persistence collaborator.

use async_trait::async_trait;
use murmur_proto::{ConversationId, MessageId, UserId};

use crate::error::StorageError;

/// Durable store for "message read by user" state.
///
/// # Invariants
///
/// - `persist_read_state` is idempotent: persisting an ID twice is harmless,
///   which is what makes re-queueing a failed batch safe
#[async_trait]
pub trait ReadStateStore: Send + Sync + 'static {
    /// Mark every message in `message_ids` as read by `user_id`.
    async fn persist_read_state(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        message_ids: &[MessageId],
    ) -> Result<(), StorageError>;
}
