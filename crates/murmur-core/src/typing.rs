//! Typing Coordinator.
//!
//! Turns keystroke-rate "user is typing" calls into a low-rate, self-
//! terminating broadcast stream:
//!
//! - at most one "start typing" broadcast per debounce window per
//!   conversation
//! - every call restarts an expiry timer; when it fires the coordinator
//!   publishes "stop typing" itself
//!
//! The privacy preference is checked before any timer work.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use murmur_proto::{Broadcast, ConversationId, EventKind, TypingStatus, UserId};
use tracing::{debug, trace, warn};

use crate::{
    connection::{BroadcastListener, ConnectionManager},
    env::Environment,
    error::SyncError,
    preferences::Preferences,
    timer::KeyedTimers,
};

/// Default minimum spacing between "start typing" broadcasts.
pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default inactivity after which typing stops automatically.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// Typing coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingConfig {
    /// Minimum spacing between "start typing" broadcasts
    pub debounce: Duration,
    /// Inactivity before an automatic "stop typing"
    pub typing_timeout: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self { debounce: DEFAULT_TYPING_DEBOUNCE, typing_timeout: DEFAULT_TYPING_TIMEOUT }
    }
}

/// Callback for inbound typing statuses.
pub type TypingCallback = Arc<dyn Fn(TypingStatus) + Send + Sync>;

#[derive(Debug)]
struct TypingState<I> {
    user_id: UserId,
    is_typing: bool,
    last_sent: Option<I>,
    last_activity: I,
}

struct TypingInner<E: Environment> {
    env: E,
    config: TypingConfig,
    connection: ConnectionManager<E>,
    preferences: Arc<dyn Preferences>,
    states: DashMap<ConversationId, TypingState<E::Instant>>,
    expiry: Arc<KeyedTimers<ConversationId>>,
}

/// Debounces outgoing typing signals and expires stale ones.
///
/// Cheap to clone; clones share state.
pub struct TypingCoordinator<E: Environment> {
    inner: Arc<TypingInner<E>>,
}

impl<E: Environment> Clone for TypingCoordinator<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment> TypingCoordinator<E> {
    /// Create a coordinator publishing through `connection`.
    pub fn new(
        env: E,
        config: TypingConfig,
        connection: ConnectionManager<E>,
        preferences: Arc<dyn Preferences>,
    ) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                env,
                config,
                connection,
                preferences,
                states: DashMap::new(),
                expiry: KeyedTimers::new(),
            }),
        }
    }

    /// The local user typed in the conversation.
    ///
    /// Publishes "start typing" unless one was sent within the debounce
    /// window while already typing. Always restarts the expiry timer. If the
    /// publish fails the local typing mark is rolled back so the next call
    /// retries.
    pub async fn on_user_typing(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), SyncError> {
        if !self.inner.preferences.is_typing_indicators_enabled() {
            return Ok(());
        }

        let now = self.inner.env.now();
        let should_send = {
            let mut state = self.inner.states.entry(conversation_id.clone()).or_insert_with(|| {
                TypingState {
                    user_id: user_id.clone(),
                    is_typing: false,
                    last_sent: None,
                    last_activity: now,
                }
            });
            state.user_id = user_id.clone();
            state.last_activity = now;

            let debounce = self.inner.config.debounce;
            let due = !state.is_typing
                || state.last_sent.is_none_or(|sent| now - sent >= debounce);
            if due {
                state.is_typing = true;
                state.last_sent = Some(now);
            }
            due
        };

        self.schedule_expiry(conversation_id);

        if !should_send {
            trace!(conversation = %conversation_id, "typing debounced");
            return Ok(());
        }

        if let Err(error) = self.publish_status(conversation_id, user_id, true).await {
            if let Some(mut state) = self.inner.states.get_mut(conversation_id)
                && state.last_sent == Some(now)
            {
                state.is_typing = false;
                state.last_sent = None;
            }
            return Err(error);
        }
        Ok(())
    }

    /// The local user stopped typing (sent the message, cleared the input).
    ///
    /// Publishes "stop typing" only if the conversation was marked typing.
    /// Safe to call when not typing.
    pub async fn on_user_stopped_typing(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), SyncError> {
        self.inner.expiry.cancel(conversation_id);
        let was_typing = self
            .inner
            .states
            .remove(conversation_id)
            .is_some_and(|(_, state)| state.is_typing);

        if !was_typing || !self.inner.preferences.is_typing_indicators_enabled() {
            return Ok(());
        }
        self.publish_status(conversation_id, user_id, false).await
    }

    /// Whether the local user is currently marked typing.
    pub fn is_user_typing(&self, conversation_id: &ConversationId) -> bool {
        self.inner.states.get(conversation_id).is_some_and(|state| state.is_typing)
    }

    /// Whether an expiry timer is pending for the conversation.
    pub fn is_expiry_pending(&self, conversation_id: &ConversationId) -> bool {
        self.inner.expiry.is_pending(conversation_id)
    }

    /// Drop local state without publishing "stop typing".
    ///
    /// Remote peers time out stale indicators on their own.
    pub fn cleanup(&self, conversation_id: &ConversationId) {
        self.inner.expiry.cancel(conversation_id);
        self.inner.states.remove(conversation_id);
    }

    /// [`cleanup`](Self::cleanup) for every conversation.
    pub fn cleanup_all(&self) {
        self.inner.expiry.cancel_all();
        self.inner.states.clear();
    }

    /// Deliver inbound typing statuses for the conversation to `callback`.
    ///
    /// Subscribes the conversation's channel. The listener survives
    /// reconnection.
    pub async fn subscribe_to_typing_events(
        &self,
        conversation_id: &ConversationId,
        callback: TypingCallback,
    ) -> Result<(), SyncError> {
        let listener: BroadcastListener = Arc::new(move |broadcast| {
            if let Broadcast::Typing(status) = broadcast {
                callback(status);
            }
        });
        self.inner.connection.listen(conversation_id, EventKind::Typing, listener);
        self.inner.connection.subscribe(conversation_id).await?;
        debug!(conversation = %conversation_id, "listening for typing events");
        Ok(())
    }

    /// Stop delivering typing events and drop local state.
    pub fn unsubscribe(&self, conversation_id: &ConversationId) {
        self.inner.connection.remove_listeners(conversation_id, EventKind::Typing);
        self.cleanup(conversation_id);
    }

    /// [`unsubscribe`](Self::unsubscribe) for every conversation.
    pub fn unsubscribe_all(&self) {
        for conversation_id in self.inner.connection.tracked_conversations() {
            self.inner.connection.remove_listeners(&conversation_id, EventKind::Typing);
        }
        self.cleanup_all();
    }

    fn schedule_expiry(&self, conversation_id: &ConversationId) {
        let coordinator: Weak<TypingInner<E>> = Arc::downgrade(&self.inner);
        let target = conversation_id.clone();

        self.inner.expiry.schedule(
            &self.inner.env,
            conversation_id.clone(),
            self.inner.config.typing_timeout,
            move || async move {
                if let Some(inner) = coordinator.upgrade() {
                    Self { inner }.expire(&target).await;
                }
            },
        );
    }

    async fn expire(&self, conversation_id: &ConversationId) {
        let now = self.inner.env.now();
        let timeout = self.inner.config.typing_timeout;
        let stale = self.inner.states.remove_if(conversation_id, |_, state| {
            now - state.last_activity >= timeout
        });

        let Some((_, state)) = stale else {
            return;
        };
        if !state.is_typing || !self.inner.preferences.is_typing_indicators_enabled() {
            return;
        }

        debug!(conversation = %conversation_id, "typing expired");
        if let Err(error) = self.publish_status(conversation_id, &state.user_id, false).await {
            warn!(conversation = %conversation_id, error = %error, "automatic stop failed");
        }
    }

    async fn publish_status(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        is_typing: bool,
    ) -> Result<(), SyncError> {
        let status = TypingStatus {
            user_id: user_id.clone(),
            conversation_id: conversation_id.clone(),
            is_typing,
            timestamp_ms: self.inner.env.wall_clock_millis(),
        };

        match self.inner.connection.publish(conversation_id, Broadcast::Typing(status)).await {
            Ok(outcome) => {
                trace!(conversation = %conversation_id, is_typing, ?outcome, "typing published");
                Ok(())
            },
            Err(error) => {
                warn!(
                    conversation = %conversation_id,
                    is_typing,
                    error = %error,
                    "typing publish failed"
                );
                Err(error)
            },
        }
    }
}
