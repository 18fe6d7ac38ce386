//! Read-Receipt Batcher.
//!
//! Coalesces "message seen" events into one persistence call and at most one
//! broadcast per conversation per batch window.
//!
//! # Invariants
//!
//! - Pending IDs have set semantics. Duplicates across calls collapse.
//! - Every `mark_messages_as_read` restarts the window, so a burst of reads
//!   is flushed as one batch.
//! - A flush swaps the pending set out atomically. Marks arriving during the
//!   flush accumulate into a fresh set.
//! - The broadcast happens only after persistence succeeds. On persistence
//!   failure the batch is merged back into the pending set and nothing is
//!   published.
//! - At most one flush per conversation is in flight. An explicit flush waits
//!   for a running timer flush before taking the pending set.
//! - `cleanup` retires the conversation's flush lane. A flush still in flight
//!   on a retired lane neither publishes nor re-queues.

#![allow(clippy::disallowed_types, reason = "Current user is read synchronously only")]

use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use murmur_proto::{Broadcast, ConversationId, EventKind, MessageId, ReadReceiptEvent, UserId};
use tracing::{debug, trace, warn};

use crate::{
    connection::{BroadcastListener, ConnectionManager},
    env::Environment,
    error::SyncError,
    metrics::FailureCategory,
    preferences::Preferences,
    storage::ReadStateStore,
    timer::KeyedTimers,
};

/// Default quiet period before a batch is flushed.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(1);

/// Read-receipt batcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptConfig {
    /// Quiet period before a batch is flushed
    pub batch_delay: Duration,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self { batch_delay: DEFAULT_BATCH_DELAY }
    }
}

/// Result of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,
    /// Read state for `count` messages was persisted
    Persisted {
        /// Messages in the batch
        count: usize,
        /// Whether the receipt broadcast was accepted (sent or queued)
        published: bool,
    },
}

/// Callback for inbound read receipts from other users.
pub type ReadReceiptCallback = Arc<dyn Fn(ReadReceiptEvent) + Send + Sync>;

#[derive(Debug)]
struct PendingBatch {
    user_id: UserId,
    message_ids: BTreeSet<MessageId>,
}

/// Serializes flushes for one conversation.
#[derive(Default)]
struct FlushLane {
    gate: tokio::sync::Mutex<()>,
    retired: AtomicBool,
}

impl FlushLane {
    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

struct ReceiptInner<E: Environment> {
    env: E,
    config: ReceiptConfig,
    connection: ConnectionManager<E>,
    store: Arc<dyn ReadStateStore>,
    preferences: Arc<dyn Preferences>,
    pending: DashMap<ConversationId, PendingBatch>,
    lanes: DashMap<ConversationId, Arc<FlushLane>>,
    flush_timers: Arc<KeyedTimers<ConversationId>>,
    current_user: Arc<Mutex<Option<UserId>>>,
}

/// Batches, persists and broadcasts read receipts.
///
/// Cheap to clone; clones share state.
pub struct ReadReceiptBatcher<E: Environment> {
    inner: Arc<ReceiptInner<E>>,
}

impl<E: Environment> Clone for ReadReceiptBatcher<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment> ReadReceiptBatcher<E> {
    /// Create a batcher persisting through `store` and publishing through
    /// `connection`.
    pub fn new(
        env: E,
        config: ReceiptConfig,
        connection: ConnectionManager<E>,
        store: Arc<dyn ReadStateStore>,
        preferences: Arc<dyn Preferences>,
    ) -> Self {
        Self {
            inner: Arc::new(ReceiptInner {
                env,
                config,
                connection,
                store,
                preferences,
                pending: DashMap::new(),
                lanes: DashMap::new(),
                flush_timers: KeyedTimers::new(),
                current_user: Arc::new(Mutex::new(None)),
            }),
        }
    }

    /// Set the local user. Inbound receipts from this user are discarded.
    pub fn set_current_user(&self, user_id: Option<UserId>) {
        *self.inner.current_user.lock().unwrap_or_else(PoisonError::into_inner) = user_id;
    }

    /// Add messages to the conversation's pending batch and restart the
    /// batch window.
    ///
    /// No-op on empty input. Must be called from within a tokio runtime.
    pub fn mark_messages_as_read<I>(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        message_ids: I,
    ) where
        I: IntoIterator<Item = MessageId>,
    {
        let mut message_ids = message_ids.into_iter().peekable();
        if message_ids.peek().is_none() {
            return;
        }

        let pending = {
            let mut batch =
                self.inner.pending.entry(conversation_id.clone()).or_insert_with(|| PendingBatch {
                    user_id: user_id.clone(),
                    message_ids: BTreeSet::new(),
                });
            batch.user_id = user_id.clone();
            batch.message_ids.extend(message_ids);
            batch.message_ids.len()
        };

        trace!(conversation = %conversation_id, pending, "messages marked read");
        self.schedule_flush(conversation_id);
    }

    /// Cancel the batch window and flush immediately.
    ///
    /// Waits for a flush already in flight for the conversation, then
    /// flushes whatever is still pending. Call before leaving a conversation
    /// so unflushed reads are not lost.
    pub async fn flush_pending_read_receipts(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<FlushOutcome, SyncError> {
        self.inner.flush_timers.cancel(conversation_id);
        self.flush(conversation_id).await
    }

    /// Messages waiting in the conversation's batch.
    pub fn pending_count(&self, conversation_id: &ConversationId) -> usize {
        self.inner.pending.get(conversation_id).map_or(0, |batch| batch.message_ids.len())
    }

    /// Whether a flush is scheduled for the conversation.
    pub fn is_flush_pending(&self, conversation_id: &ConversationId) -> bool {
        self.inner.flush_timers.is_pending(conversation_id)
    }

    /// Drop the pending batch without flushing.
    ///
    /// A flush already in flight still persists but no longer publishes or
    /// re-queues. Hard teardown only. Normal navigation should flush first.
    pub fn cleanup(&self, conversation_id: &ConversationId) {
        self.inner.flush_timers.cancel(conversation_id);
        if let Some((_, lane)) = self.inner.lanes.remove(conversation_id) {
            lane.retire();
        }
        if let Some((_, batch)) = self.inner.pending.remove(conversation_id) {
            debug!(
                conversation = %conversation_id,
                dropped = batch.message_ids.len(),
                "pending read receipts dropped"
            );
        }
    }

    /// [`cleanup`](Self::cleanup) for every conversation.
    pub fn cleanup_all(&self) {
        self.inner.flush_timers.cancel_all();
        self.inner.lanes.retain(|_, lane| {
            lane.retire();
            false
        });
        self.inner.pending.clear();
    }

    /// Deliver read receipts from other users to `callback`.
    ///
    /// Receipts whose sender is the current user are discarded before the
    /// callback runs. Subscribes the conversation's channel.
    pub async fn subscribe_to_read_receipts(
        &self,
        conversation_id: &ConversationId,
        callback: ReadReceiptCallback,
    ) -> Result<(), SyncError> {
        let current_user = Arc::clone(&self.inner.current_user);
        let listener: BroadcastListener = Arc::new(move |broadcast| {
            let Broadcast::ReadReceipt(event) = broadcast else {
                return;
            };
            let is_own = current_user
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|me| *me == event.user_id);
            if !is_own {
                callback(event);
            }
        });

        self.inner.connection.listen(conversation_id, EventKind::ReadReceipt, listener);
        self.inner.connection.subscribe(conversation_id).await?;
        debug!(conversation = %conversation_id, "listening for read receipts");
        Ok(())
    }

    /// Stop delivering read receipts and drop the pending batch.
    pub fn unsubscribe(&self, conversation_id: &ConversationId) {
        self.inner.connection.remove_listeners(conversation_id, EventKind::ReadReceipt);
        self.cleanup(conversation_id);
    }

    /// [`unsubscribe`](Self::unsubscribe) for every conversation.
    pub fn unsubscribe_all(&self) {
        for conversation_id in self.inner.connection.tracked_conversations() {
            self.inner.connection.remove_listeners(&conversation_id, EventKind::ReadReceipt);
        }
        self.cleanup_all();
    }

    fn schedule_flush(&self, conversation_id: &ConversationId) {
        let batcher: Weak<ReceiptInner<E>> = Arc::downgrade(&self.inner);
        let target = conversation_id.clone();

        self.inner.flush_timers.schedule(
            &self.inner.env,
            conversation_id.clone(),
            self.inner.config.batch_delay,
            move || async move {
                let Some(inner) = batcher.upgrade() else {
                    return;
                };
                match (Self { inner }).flush(&target).await {
                    Ok(outcome) => trace!(conversation = %target, ?outcome, "scheduled flush done"),
                    Err(error) => {
                        trace!(conversation = %target, error = %error, "scheduled flush failed");
                    },
                }
            },
        );
    }

    fn lane(&self, conversation_id: &ConversationId) -> Arc<FlushLane> {
        Arc::clone(self.inner.lanes.entry(conversation_id.clone()).or_default().value())
    }

    async fn flush(&self, conversation_id: &ConversationId) -> Result<FlushOutcome, SyncError> {
        loop {
            let lane = self.lane(conversation_id);
            let _flushing = lane.gate.lock().await;
            // Retired while waiting: the next lookup yields a fresh lane
            if lane.is_retired() {
                continue;
            }
            return self.flush_locked(conversation_id, &lane).await;
        }
    }

    /// Swap, persist, publish. Caller holds the lane's gate.
    async fn flush_locked(
        &self,
        conversation_id: &ConversationId,
        lane: &FlushLane,
    ) -> Result<FlushOutcome, SyncError> {
        let Some((_, batch)) = self.inner.pending.remove(conversation_id) else {
            return Ok(FlushOutcome::Empty);
        };
        if batch.message_ids.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let user_id = batch.user_id;
        let message_ids: Vec<MessageId> = batch.message_ids.into_iter().collect();
        let count = message_ids.len();

        let persisted =
            self.inner.store.persist_read_state(conversation_id, &user_id, &message_ids).await;

        if lane.is_retired() {
            if let Err(error) = persisted {
                self.inner.connection.metrics().record_failed_event(FailureCategory::Persistence);
                warn!(
                    conversation = %conversation_id,
                    count,
                    error = %error,
                    "read state not persisted, conversation cleaned up so batch dropped"
                );
                return Err(error.into());
            }
            debug!(conversation = %conversation_id, count, "conversation cleaned up, not published");
            return Ok(FlushOutcome::Persisted { count, published: false });
        }

        if let Err(error) = persisted {
            self.requeue(conversation_id, user_id, message_ids);
            self.inner.connection.metrics().record_failed_event(FailureCategory::Persistence);
            warn!(
                conversation = %conversation_id,
                count,
                error = %error,
                "read state not persisted, batch re-queued"
            );
            return Err(error.into());
        }

        if !self.inner.preferences.is_read_receipts_enabled() {
            debug!(conversation = %conversation_id, count, "read receipts disabled, not published");
            return Ok(FlushOutcome::Persisted { count, published: false });
        }

        let event = ReadReceiptEvent {
            conversation_id: conversation_id.clone(),
            user_id,
            message_ids,
            timestamp_ms: self.inner.env.wall_clock_millis(),
        };
        let result = self.inner.connection.publish(conversation_id, Broadcast::ReadReceipt(event)).await;
        let published = match result {
            Ok(outcome) => {
                debug!(conversation = %conversation_id, count, ?outcome, "read receipt flushed");
                true
            },
            Err(error) => {
                warn!(
                    conversation = %conversation_id,
                    count,
                    error = %error,
                    "read receipt publish failed, read state is persisted"
                );
                false
            },
        };

        Ok(FlushOutcome::Persisted { count, published })
    }

    /// Merge a failed batch into whatever has accumulated since the swap.
    fn requeue(&self, conversation_id: &ConversationId, user_id: UserId, message_ids: Vec<MessageId>) {
        self.inner
            .pending
            .entry(conversation_id.clone())
            .or_insert_with(|| PendingBatch { user_id, message_ids: BTreeSet::new() })
            .message_ids
            .extend(message_ids);
    }
}
