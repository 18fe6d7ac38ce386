//! Connection Manager: one realtime subscription per conversation.
//!
//! The manager is the only owner of channel handles. Typing and read-receipt
//! components publish through it, which serializes failure handling and
//! reconnection per conversation.
//!
//! # Concurrency
//!
//! Each conversation has a slot with two locks:
//!
//! - `gate`: async mutex held across transport I/O. Subscribe, publish,
//!   reconnect and unsubscribe for one conversation never interleave.
//! - `status`: sync mutex for bookkeeping. Never held across an await, so
//!   queries stay non-blocking while I/O is in flight.
//!
//! Unrelated conversations never contend: slots live in a lock-striped map.
//!
//! # Self-healing
//!
//! A failed subscribe or publish moves the channel to `Error` and schedules a
//! reconnection with exponential backoff (see [`next_action`]). Publishes
//! made while that reconnection is pending are queued and replayed once it
//! succeeds, so only the scheduled attempts touch the transport. When the
//! attempt budget is exhausted the conversation falls back to polling: the
//! channel moves to `Disconnected`, automatic retries stop, and publishes are
//! queued until an explicit [`ConnectionManager::reconnect`].

#![allow(clippy::disallowed_types, reason = "Status records are locked synchronously only")]

mod backoff;
mod observer;
mod queue;
mod state;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

pub use backoff::{FailureAction, next_action, reconnect_delay};
use bytes::Bytes;
use dashmap::DashMap;
use murmur_proto::{Broadcast, ConversationId, EventKind};
pub use observer::{ObserverId, StateObserver};
pub use state::{ConnectionState, StateTransition};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use self::{observer::ObserverRegistry, state::ChannelStatus};
use crate::{
    env::Environment,
    error::{SyncError, TransportError},
    metrics::{FailureCategory, RealtimeMetrics},
    timer::KeyedTimers,
    transport::{BroadcastHandler, RealtimeChannel, RealtimeTransport},
};

/// Default number of consecutive failures before polling fallback.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default base delay for exponential backoff.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default polling interval suggested to callers in fallback mode.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5);

/// Default window after the last success within which the connection is
/// considered healthy.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on queued typing statuses per conversation.
pub const DEFAULT_TYPING_QUEUE_LIMIT: usize = 50;

/// Default bound on queued read receipts per conversation.
pub const DEFAULT_RECEIPT_QUEUE_LIMIT: usize = 100;

/// Connection manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Consecutive failures before polling fallback
    pub max_reconnect_attempts: u32,
    /// Backoff base: attempt `n` waits `base * 2^n`
    pub reconnect_base_delay: Duration,
    /// Refresh interval for callers polling in fallback mode
    pub polling_interval: Duration,
    /// Health window after the last successful subscribe or publish
    pub connection_timeout: Duration,
    /// Typing statuses queued per conversation while degraded
    pub typing_queue_limit: usize,
    /// Read receipts queued per conversation while degraded
    pub receipt_queue_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            typing_queue_limit: DEFAULT_TYPING_QUEUE_LIMIT,
            receipt_queue_limit: DEFAULT_RECEIPT_QUEUE_LIMIT,
        }
    }
}

/// Result of a successful [`ConnectionManager::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Delivered to the transport
    Sent,
    /// Held in the degraded-mode queue until the next successful reconnect
    Queued,
}

/// Callback for decoded inbound broadcasts.
pub type BroadcastListener = Arc<dyn Fn(Broadcast) + Send + Sync>;

type ChannelHandle = Arc<dyn RealtimeChannel>;

struct ChannelSlot<I> {
    gate: tokio::sync::Mutex<Option<ChannelHandle>>,
    status: Mutex<ChannelStatus<I>>,
}

impl<I: Copy> ChannelSlot<I> {
    fn new() -> Self {
        Self { gate: tokio::sync::Mutex::new(None), status: Mutex::new(ChannelStatus::new()) }
    }

    fn status(&self) -> MutexGuard<'_, ChannelStatus<I>> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        self.status().state.clone()
    }

    fn last_success(&self) -> Option<I> {
        self.status().last_success
    }
}

struct Inner<E: Environment> {
    env: E,
    config: ConnectionConfig,
    transport: Arc<dyn RealtimeTransport>,
    metrics: Arc<RealtimeMetrics>,
    slots: DashMap<ConversationId, Arc<ChannelSlot<E::Instant>>>,
    listeners: DashMap<ConversationId, Vec<(EventKind, BroadcastListener)>>,
    reconnect_timers: Arc<KeyedTimers<ConversationId>>,
    observers: ObserverRegistry,
    global: watch::Sender<ConnectionState>,
    connected_since: Mutex<Option<E::Instant>>,
}

/// Owns one realtime channel per conversation and keeps it alive.
///
/// Cheap to clone; clones share the same channels.
pub struct ConnectionManager<E: Environment> {
    inner: Arc<Inner<E>>,
}

impl<E: Environment> Clone for ConnectionManager<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment> ConnectionManager<E> {
    /// Create a manager with no conversations.
    pub fn new(
        env: E,
        transport: Arc<dyn RealtimeTransport>,
        config: ConnectionConfig,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        let (global, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                env,
                config,
                transport,
                metrics,
                slots: DashMap::new(),
                listeners: DashMap::new(),
                reconnect_timers: KeyedTimers::new(),
                observers: ObserverRegistry::default(),
                global,
                connected_since: Mutex::new(None),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Shared metrics recorder.
    pub fn metrics(&self) -> &Arc<RealtimeMetrics> {
        &self.inner.metrics
    }

    /// Subscribe to the conversation's channel.
    ///
    /// Idempotent: returns the existing channel if already connected. On
    /// failure the channel is left in `Error`, a reconnection is scheduled,
    /// and the cause is returned.
    pub async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Arc<dyn RealtimeChannel>, SyncError> {
        let slot = self.slot_or_insert(conversation_id);
        let mut gate = slot.gate.lock().await;

        if slot.status().retired {
            return Err(TransportError::Closed(conversation_id.channel_name()).into());
        }
        if let Some(channel) = gate.as_ref().filter(|_| slot.state().is_connected()) {
            return Ok(Arc::clone(channel));
        }

        match self.attempt(conversation_id, &slot, &mut gate).await {
            Ok(channel) => Ok(channel),
            Err(error) => {
                self.on_failure(conversation_id, &slot, &error);
                Err(error.into())
            },
        }
    }

    /// Publish a broadcast on the conversation's channel.
    ///
    /// Subscribes first if there is no connected channel, then publishes
    /// exactly once. In polling fallback, or while a backoff reconnection is
    /// pending, the broadcast is queued instead and the transport is not
    /// touched.
    ///
    /// A failed publish moves the channel to `Error` and schedules a
    /// reconnection. The payload itself is not retried.
    pub async fn publish(
        &self,
        conversation_id: &ConversationId,
        broadcast: Broadcast,
    ) -> Result<PublishOutcome, SyncError> {
        let kind = broadcast.kind();
        let payload = broadcast.encode()?;

        let slot = self.slot_or_insert(conversation_id);
        let mut gate = slot.gate.lock().await;

        if self.enqueue_if_degraded(conversation_id, &slot, &broadcast) {
            return Ok(PublishOutcome::Queued);
        }

        let live = gate.as_ref().filter(|_| slot.state().is_connected()).cloned();
        let channel = match live {
            Some(channel) => channel,
            None => match self.attempt(conversation_id, &slot, &mut gate).await {
                Ok(channel) => channel,
                Err(error) => {
                    self.record_publish_failure(kind);
                    self.on_failure(conversation_id, &slot, &error);
                    return Err(error.into());
                },
            },
        };

        let started = self.inner.env.now();
        match channel.publish(kind.as_str(), payload).await {
            Ok(()) => {
                let finished = self.inner.env.now();
                slot.status().last_success = Some(finished);
                self.record_publish_success(&broadcast, finished - started);
                Ok(PublishOutcome::Sent)
            },
            Err(error) => {
                warn!(
                    conversation = %conversation_id,
                    event = kind.as_str(),
                    error = %error,
                    "publish failed"
                );
                self.record_publish_failure(kind);
                self.on_failure(conversation_id, &slot, &error);
                Err(error.into())
            },
        }
    }

    /// The transport reported that a connected channel was lost.
    ///
    /// Enters the reconnection flow. Ignored unless the channel is currently
    /// connected.
    pub async fn handle_channel_lost(&self, conversation_id: &ConversationId, cause: TransportError) {
        let Some(slot) = self.slot(conversation_id) else {
            return;
        };
        let _gate = slot.gate.lock().await;

        let connected = {
            let status = slot.status();
            !status.retired && status.state.is_connected()
        };
        if !connected {
            return;
        }

        warn!(conversation = %conversation_id, error = %cause, "channel lost");
        self.on_failure(conversation_id, &slot, &cause);
    }

    /// Leave the conversation.
    ///
    /// Cancels any pending reconnection, closes the channel, discards queued
    /// broadcasts and listeners. When no conversation remains the global
    /// state is `Disconnected`.
    pub async fn unsubscribe(&self, conversation_id: &ConversationId) {
        self.inner.listeners.remove(conversation_id);
        let Some((_, slot)) = self.inner.slots.remove(conversation_id) else {
            return;
        };

        let channel = {
            let mut gate = slot.gate.lock().await;
            slot.status().retired = true;
            gate.take()
        };
        self.inner.reconnect_timers.cancel(conversation_id);

        if let Some(channel) = channel {
            self.inner.transport.close_channel(channel).await;
        }

        let dropped = slot.status().queue.clear();
        if dropped > 0 {
            debug!(conversation = %conversation_id, dropped, "discarded queued broadcasts");
            self.refresh_queue_gauge();
        }

        self.transition(conversation_id, &slot, ConnectionState::Disconnected);
        if self.inner.slots.is_empty() {
            self.end_uptime();
        }
        info!(conversation = %conversation_id, "unsubscribed");
    }

    /// Reset the attempt counter and polling fallback, then subscribe
    /// afresh.
    ///
    /// On success, broadcasts queued while degraded are replayed coalesced.
    /// On failure the normal backoff cycle restarts from attempt zero.
    pub async fn reconnect(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        let slot = self.slot_or_insert(conversation_id);
        self.inner.reconnect_timers.cancel(conversation_id);
        let mut gate = slot.gate.lock().await;

        {
            let mut status = slot.status();
            if status.retired {
                return Err(TransportError::Closed(conversation_id.channel_name()).into());
            }
            status.attempts = 0;
            status.polling_fallback = false;
        }

        info!(conversation = %conversation_id, "reconnecting");
        match self.attempt(conversation_id, &slot, &mut gate).await {
            Ok(_) => {
                self.inner.metrics.record_reconnection(true);
                drop(gate);
                self.replay_queue(conversation_id, &slot).await;
                Ok(())
            },
            Err(error) => {
                self.inner.metrics.record_reconnection(false);
                self.on_failure(conversation_id, &slot, &error);
                Err(error.into())
            },
        }
    }

    /// Explicitly reconnect every tracked conversation.
    ///
    /// Returns how many reconnected successfully.
    pub async fn reconnect_all(&self) -> usize {
        let mut reconnected = 0;
        for conversation_id in self.tracked_conversations() {
            match self.reconnect(&conversation_id).await {
                Ok(()) => reconnected += 1,
                Err(error) => {
                    warn!(conversation = %conversation_id, error = %error, "reconnect failed");
                },
            }
        }
        reconnected
    }

    /// Register a listener for decoded inbound broadcasts of one kind.
    ///
    /// Listeners belong to the manager, not to a channel, so they survive
    /// reconnection.
    pub fn listen(
        &self,
        conversation_id: &ConversationId,
        kind: EventKind,
        listener: BroadcastListener,
    ) {
        self.inner.listeners.entry(conversation_id.clone()).or_default().push((kind, listener));
    }

    /// Remove every listener of one kind for the conversation.
    pub fn remove_listeners(&self, conversation_id: &ConversationId, kind: EventKind) {
        if let Some(mut listeners) = self.inner.listeners.get_mut(conversation_id) {
            listeners.retain(|(existing, _)| *existing != kind);
        }
        self.inner.listeners.remove_if(conversation_id, |_, listeners| listeners.is_empty());
    }

    /// Register an observer for every state transition.
    pub fn add_observer(&self, observer: StateObserver) -> ObserverId {
        self.inner.observers.add(observer)
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.observers.remove(id)
    }

    /// Aggregate state: the most advanced state across conversations.
    pub fn state(&self) -> ConnectionState {
        self.inner.global.borrow().clone()
    }

    /// Stream of aggregate state changes.
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.inner.global.subscribe()
    }

    /// State of one conversation's channel.
    pub fn state_of(&self, conversation_id: &ConversationId) -> ConnectionState {
        self.slot(conversation_id).map_or(ConnectionState::Disconnected, |slot| slot.state())
    }

    /// Whether the conversation's channel is connected.
    pub fn is_subscribed(&self, conversation_id: &ConversationId) -> bool {
        self.state_of(conversation_id).is_connected()
    }

    /// Whether the conversation has degraded to polling.
    pub fn is_using_polling_fallback(&self, conversation_id: &ConversationId) -> bool {
        self.slot(conversation_id).is_some_and(|slot| slot.status().polling_fallback)
    }

    /// Whether any conversation has degraded to polling.
    pub fn is_any_using_polling_fallback(&self) -> bool {
        self.inner.slots.iter().any(|entry| entry.value().status().polling_fallback)
    }

    /// How often callers in polling fallback should refresh from storage.
    pub fn polling_interval(&self) -> Duration {
        self.inner.config.polling_interval
    }

    /// Consecutive failures since the last success.
    pub fn reconnect_attempts(&self, conversation_id: &ConversationId) -> u32 {
        self.slot(conversation_id).map_or(0, |slot| slot.status().attempts)
    }

    /// Whether an automatic reconnection is scheduled.
    pub fn is_reconnect_pending(&self, conversation_id: &ConversationId) -> bool {
        self.inner.reconnect_timers.is_pending(conversation_id)
    }

    /// Broadcasts queued for the conversation while degraded.
    pub fn queued_count(&self, conversation_id: &ConversationId) -> usize {
        self.slot(conversation_id).map_or(0, |slot| slot.status().queue.len())
    }

    /// Time since the most recent successful subscribe or publish on any
    /// channel.
    pub fn time_since_last_connection(&self) -> Option<Duration> {
        let now = self.inner.env.now();
        self.inner
            .slots
            .iter()
            .filter_map(|entry| entry.value().last_success())
            .max()
            .map(|last| now - last)
    }

    /// Connected, with a success within the connection timeout.
    pub fn is_connection_healthy(&self) -> bool {
        self.state().is_connected()
            && self
                .time_since_last_connection()
                .is_some_and(|elapsed| elapsed < self.inner.config.connection_timeout)
    }

    /// Conversations with a channel slot.
    pub fn tracked_conversations(&self) -> Vec<ConversationId> {
        self.inner.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Unsubscribe everything, cancel every timer, drop observers.
    pub async fn shutdown(&self) {
        let conversations = self.tracked_conversations();
        for conversation_id in &conversations {
            self.unsubscribe(conversation_id).await;
        }
        self.inner.reconnect_timers.cancel_all();
        self.inner.listeners.clear();
        self.inner.observers.clear();
        info!(conversations = conversations.len(), "connection manager shut down");
    }

    fn slot(&self, conversation_id: &ConversationId) -> Option<Arc<ChannelSlot<E::Instant>>> {
        self.inner.slots.get(conversation_id).map(|entry| Arc::clone(entry.value()))
    }

    fn slot_or_insert(&self, conversation_id: &ConversationId) -> Arc<ChannelSlot<E::Instant>> {
        Arc::clone(
            self.inner
                .slots
                .entry(conversation_id.clone())
                .or_insert_with(|| Arc::new(ChannelSlot::new()))
                .value(),
        )
    }

    /// One subscribe attempt on a fresh channel. Caller holds the gate.
    ///
    /// The previous channel, if any, is closed first. Failure handling is
    /// left to the caller.
    async fn attempt(
        &self,
        conversation_id: &ConversationId,
        slot: &ChannelSlot<E::Instant>,
        gate: &mut Option<ChannelHandle>,
    ) -> Result<ChannelHandle, TransportError> {
        if let Some(stale) = gate.take() {
            self.inner.transport.close_channel(stale).await;
        }
        self.transition(conversation_id, slot, ConnectionState::Connecting);

        let channel = self.inner.transport.open_channel(&conversation_id.channel_name());
        self.attach_dispatchers(conversation_id, &channel);

        if let Err(error) = channel.subscribe().await {
            self.inner.transport.close_channel(channel).await;
            return Err(error);
        }

        {
            let mut status = slot.status();
            status.attempts = 0;
            status.polling_fallback = false;
            status.last_success = Some(self.inner.env.now());
        }
        *gate = Some(Arc::clone(&channel));
        self.inner.reconnect_timers.cancel(conversation_id);
        self.transition(conversation_id, slot, ConnectionState::Connected);
        self.start_uptime();

        info!(conversation = %conversation_id, channel = channel.name(), "subscribed");
        Ok(channel)
    }

    /// Count the failure and either schedule the next attempt or degrade to
    /// polling. Caller holds the gate.
    fn on_failure(
        &self,
        conversation_id: &ConversationId,
        slot: &ChannelSlot<E::Instant>,
        cause: &TransportError,
    ) {
        let failures = {
            let mut status = slot.status();
            if status.retired {
                return;
            }
            status.attempts = status.attempts.saturating_add(1);
            status.attempts
        };
        self.transition(conversation_id, slot, ConnectionState::Error(cause.reason()));

        let config = &self.inner.config;
        match next_action(failures, config.max_reconnect_attempts, config.reconnect_base_delay) {
            FailureAction::Retry { attempt, delay } => {
                warn!(
                    conversation = %conversation_id,
                    attempt,
                    ?delay,
                    error = %cause,
                    "connection failed, reconnect scheduled"
                );
                self.schedule_reconnect(conversation_id, delay);
            },
            FailureAction::Fallback => {
                self.inner.reconnect_timers.cancel(conversation_id);
                let activated = !std::mem::replace(&mut slot.status().polling_fallback, true);
                self.transition(conversation_id, slot, ConnectionState::Disconnected);

                if activated {
                    self.inner.metrics.record_polling_fallback_activation();
                    error!(
                        conversation = %conversation_id,
                        attempts = failures,
                        error = %cause,
                        "reconnect budget exhausted, falling back to polling"
                    );
                }
            },
        }
    }

    fn schedule_reconnect(&self, conversation_id: &ConversationId, delay: Duration) {
        let manager = Arc::downgrade(&self.inner);
        let target = conversation_id.clone();

        self.inner.reconnect_timers.schedule(
            &self.inner.env,
            conversation_id.clone(),
            delay,
            move || async move {
                if let Some(inner) = manager.upgrade() {
                    Self { inner }.run_scheduled_reconnect(&target).await;
                }
            },
        );
    }

    async fn run_scheduled_reconnect(&self, conversation_id: &ConversationId) {
        let Some(slot) = self.slot(conversation_id) else {
            return;
        };
        let mut gate = slot.gate.lock().await;

        // A failure while this task waited on the gate already rescheduled
        let superseded = self.inner.reconnect_timers.is_pending(conversation_id);
        let (skip, failures) = {
            let status = slot.status();
            let skip = superseded
                || status.retired
                || status.polling_fallback
                || status.state.is_connected();
            (skip, status.attempts)
        };
        if skip {
            return;
        }

        debug!(
            conversation = %conversation_id,
            attempt = failures.saturating_sub(1),
            "reconnect attempt"
        );
        match self.attempt(conversation_id, &slot, &mut gate).await {
            Ok(_) => {
                self.inner.metrics.record_reconnection(true);
                info!(conversation = %conversation_id, "reconnected");
                drop(gate);
                self.replay_queue(conversation_id, &slot).await;
            },
            Err(error) => {
                self.inner.metrics.record_reconnection(false);
                self.on_failure(conversation_id, &slot, &error);
            },
        }
    }

    /// Queue the broadcast if the conversation is in polling fallback or
    /// waiting out a backoff delay. Caller holds the gate.
    fn enqueue_if_degraded(
        &self,
        conversation_id: &ConversationId,
        slot: &ChannelSlot<E::Instant>,
        broadcast: &Broadcast,
    ) -> bool {
        let (evicted, reason) = {
            let mut status = slot.status();
            let reason = if status.polling_fallback {
                "polling fallback, broadcast queued"
            } else if !status.state.is_connected()
                && self.inner.reconnect_timers.is_pending(conversation_id)
            {
                "reconnect pending, broadcast queued"
            } else {
                return false;
            };
            let config = &self.inner.config;
            let evicted = status.queue.push(
                broadcast.clone(),
                config.typing_queue_limit,
                config.receipt_queue_limit,
            );
            (evicted, reason)
        };

        debug!(
            conversation = %conversation_id,
            event = broadcast.kind().as_str(),
            evicted,
            "{reason}"
        );
        self.refresh_queue_gauge();
        true
    }

    async fn replay_queue(&self, conversation_id: &ConversationId, slot: &ChannelSlot<E::Instant>) {
        let pending = slot.status().queue.drain_coalesced();
        if pending.is_empty() {
            return;
        }
        self.refresh_queue_gauge();

        info!(conversation = %conversation_id, count = pending.len(), "replaying queued broadcasts");
        for broadcast in pending {
            if let Err(error) = self.publish(conversation_id, broadcast).await {
                warn!(conversation = %conversation_id, error = %error, "replay failed");
            }
        }
    }

    fn start_uptime(&self) {
        let mut since = self.inner.connected_since.lock().unwrap_or_else(PoisonError::into_inner);
        if since.is_none() {
            *since = Some(self.inner.env.now());
        }
    }

    fn end_uptime(&self) {
        let started =
            self.inner.connected_since.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(started) = started {
            self.inner.metrics.record_connection_time(self.inner.env.now() - started);
        }
    }

    fn refresh_queue_gauge(&self) {
        let total: usize =
            self.inner.slots.iter().map(|entry| entry.value().status().queue.len()).sum();
        self.inner.metrics.update_queued_events(total);
    }

    fn record_publish_success(&self, broadcast: &Broadcast, latency: Duration) {
        match broadcast {
            Broadcast::Typing(_) => self.inner.metrics.record_typing_event_sent(Some(latency)),
            Broadcast::ReadReceipt(event) => {
                self.inner.metrics.record_read_receipt_sent(event.message_ids.len(), Some(latency));
            },
        }
    }

    fn record_publish_failure(&self, kind: EventKind) {
        let category = match kind {
            EventKind::Typing => FailureCategory::Typing,
            EventKind::ReadReceipt => FailureCategory::ReadReceipt,
        };
        self.inner.metrics.record_failed_event(category);
    }

    /// Route inbound broadcasts of every kind to the manager's listeners.
    ///
    /// Dispatchers look listeners up at delivery time, so listeners added or
    /// removed later take effect on live channels.
    fn attach_dispatchers(&self, conversation_id: &ConversationId, channel: &ChannelHandle) {
        for kind in [EventKind::Typing, EventKind::ReadReceipt] {
            let manager = Arc::downgrade(&self.inner);
            let target = conversation_id.clone();
            let handler: BroadcastHandler = Arc::new(move |payload: Bytes| {
                if let Some(inner) = manager.upgrade() {
                    Self { inner }.dispatch(&target, kind, &payload);
                }
            });
            channel.on_broadcast(kind.as_str(), handler);
        }
    }

    fn dispatch(&self, conversation_id: &ConversationId, kind: EventKind, payload: &[u8]) {
        let broadcast = match Broadcast::decode(kind, payload) {
            Ok(broadcast) => broadcast,
            Err(error) => {
                warn!(
                    conversation = %conversation_id,
                    event = kind.as_str(),
                    error = %error,
                    "dropping undecodable broadcast"
                );
                return;
            },
        };

        let listeners: Vec<BroadcastListener> = self
            .inner
            .listeners
            .get(conversation_id)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|(listener_kind, _)| *listener_kind == kind)
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect()
            })
            .unwrap_or_default();

        for listener in listeners {
            listener(broadcast.clone());
        }
    }

    fn transition(
        &self,
        conversation_id: &ConversationId,
        slot: &ChannelSlot<E::Instant>,
        to: ConnectionState,
    ) {
        let from = std::mem::replace(&mut slot.status().state, to.clone());
        if from == to {
            return;
        }

        debug!(conversation = %conversation_id, ?from, ?to, "state transition");
        self.refresh_global_state(&to);
        self.inner.observers.notify(&StateTransition {
            conversation_id: conversation_id.clone(),
            from,
            to,
        });
    }

    /// Fold channel states into the aggregate: `Connected` beats `Connecting`
    /// beats `Error` beats `Disconnected`. Among errors the latest reason
    /// wins.
    ///
    /// The fold runs under the watch channel's write lock, so concurrent
    /// refreshes are ordered and the last one sees every prior transition.
    fn refresh_global_state(&self, latest: &ConnectionState) {
        self.inner.global.send_if_modified(|current| {
            let mut aggregate = ConnectionState::Disconnected;
            for entry in self.inner.slots.iter() {
                let state = entry.value().state();
                if state.rank() > aggregate.rank() {
                    aggregate = state;
                }
            }
            if aggregate.is_error() && latest.is_error() {
                aggregate = latest.clone();
            }

            if *current == aggregate {
                return false;
            }
            *current = aggregate;
            true
        });
    }
}
