//! In-memory read-state store.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use murmur_core::{ReadStateStore, StorageError};
use murmur_proto::{ConversationId, MessageId, UserId};

/// One persistence attempt as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistCall {
    /// Conversation the batch belongs to
    pub conversation_id: ConversationId,
    /// Reader
    pub user_id: UserId,
    /// Batch contents, in the order received
    pub message_ids: Vec<MessageId>,
    /// Whether the write was accepted
    pub succeeded: bool,
}

#[derive(Default)]
struct StoreState {
    read: HashMap<(ConversationId, UserId), BTreeSet<MessageId>>,
    calls: Vec<PersistCall>,
    fail_next: usize,
    fail_all: bool,
    latency: Duration,
}

/// Read-state store backed by a map, recording every call.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct MemoryReadStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryReadStore {
    /// Empty store that accepts every write.
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("Mutex poisoned")
    }

    /// Reject the next `count` writes with an I/O error.
    pub fn fail_next_persists(&self, count: usize) {
        self.lock().fail_next += count;
    }

    /// Reject every write while `fail` is set.
    pub fn fail_all_persists(&self, fail: bool) {
        self.lock().fail_all = fail;
    }

    /// Delay every write by `latency` before it is recorded and applied.
    pub fn set_persist_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Every persistence attempt, in order.
    pub fn persist_calls(&self) -> Vec<PersistCall> {
        self.lock().calls.clone()
    }

    /// Number of persistence attempts.
    pub fn persist_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Messages recorded as read by `user_id` in the conversation.
    pub fn read_messages(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> BTreeSet<MessageId> {
        self.lock()
            .read
            .get(&(conversation_id.clone(), user_id.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReadStateStore for MemoryReadStore {
    async fn persist_read_state(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        message_ids: &[MessageId],
    ) -> Result<(), StorageError> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();

        let fail = state.fail_all || state.fail_next > 0;
        state.fail_next = state.fail_next.saturating_sub(1);
        state.calls.push(PersistCall {
            conversation_id: conversation_id.clone(),
            user_id: user_id.clone(),
            message_ids: message_ids.to_vec(),
            succeeded: !fail,
        });

        if fail {
            return Err(StorageError::Io("injected write failure".to_string()));
        }

        state
            .read
            .entry((conversation_id.clone(), user_id.clone()))
            .or_default()
            .extend(message_ids.iter().cloned());
        Ok(())
    }
}
