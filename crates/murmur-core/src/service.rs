//! Composed realtime service.
//!
//! Wires one [`ConnectionManager`], [`TypingCoordinator`] and
//! [`ReadReceiptBatcher`] around a shared [`RealtimeMetrics`].

use std::{sync::Arc, time::Duration};

use murmur_proto::ConversationId;
use tracing::{info, warn};

use crate::{
    connection::{ConnectionConfig, ConnectionManager},
    env::Environment,
    error::{ConfigError, SyncError},
    metrics::{MetricsConfig, RealtimeMetrics},
    preferences::Preferences,
    receipts::{FlushOutcome, ReadReceiptBatcher, ReceiptConfig},
    storage::ReadStateStore,
    transport::RealtimeTransport,
    typing::{TypingConfig, TypingCoordinator},
};

/// Configuration for every component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfig {
    /// Connection manager settings
    pub connection: ConnectionConfig,
    /// Typing coordinator settings
    pub typing: TypingConfig,
    /// Read-receipt batcher settings
    pub receipts: ReceiptConfig,
    /// Metrics settings
    pub metrics: MetricsConfig,
}

impl SyncConfig {
    /// Check that every delay and capacity is usable.
    ///
    /// # Errors
    ///
    /// - `ConfigError::ZeroDuration` for a zero delay or interval
    /// - `ConfigError::ZeroCapacity` for a zero attempt budget, queue limit
    ///   or latency window
    /// - `ConfigError::DebounceExceedsTimeout` if the typing debounce is not
    ///   shorter than the typing timeout
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations: [(&'static str, Duration); 6] = [
            ("connection.reconnect_base_delay", self.connection.reconnect_base_delay),
            ("connection.polling_interval", self.connection.polling_interval),
            ("connection.connection_timeout", self.connection.connection_timeout),
            ("typing.debounce", self.typing.debounce),
            ("typing.typing_timeout", self.typing.typing_timeout),
            ("receipts.batch_delay", self.receipts.batch_delay),
        ];
        if let Some(&(field, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::ZeroDuration { field });
        }

        let capacities: [(&'static str, usize); 4] = [
            (
                "connection.max_reconnect_attempts",
                self.connection.max_reconnect_attempts as usize,
            ),
            ("connection.typing_queue_limit", self.connection.typing_queue_limit),
            ("connection.receipt_queue_limit", self.connection.receipt_queue_limit),
            ("metrics.latency_window", self.metrics.latency_window),
        ];
        if let Some(&(field, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroCapacity { field });
        }

        if self.typing.debounce >= self.typing.typing_timeout {
            return Err(ConfigError::DebounceExceedsTimeout {
                debounce: self.typing.debounce,
                timeout: self.typing.typing_timeout,
            });
        }

        Ok(())
    }
}

/// The realtime synchronization core as one service.
pub struct RealtimeSync<E: Environment> {
    connection: ConnectionManager<E>,
    typing: TypingCoordinator<E>,
    receipts: ReadReceiptBatcher<E>,
    metrics: Arc<RealtimeMetrics>,
}

impl<E: Environment> RealtimeSync<E> {
    /// Validate `config` and build every component.
    pub fn new(
        env: E,
        transport: Arc<dyn RealtimeTransport>,
        store: Arc<dyn ReadStateStore>,
        preferences: Arc<dyn Preferences>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let metrics = Arc::new(RealtimeMetrics::new(&config.metrics));
        let connection = ConnectionManager::new(
            env.clone(),
            transport,
            config.connection,
            Arc::clone(&metrics),
        );
        let typing = TypingCoordinator::new(
            env.clone(),
            config.typing,
            connection.clone(),
            Arc::clone(&preferences),
        );
        let receipts =
            ReadReceiptBatcher::new(env, config.receipts, connection.clone(), store, preferences);

        Ok(Self { connection, typing, receipts, metrics })
    }

    /// Connection manager.
    pub fn connection(&self) -> &ConnectionManager<E> {
        &self.connection
    }

    /// Typing coordinator.
    pub fn typing(&self) -> &TypingCoordinator<E> {
        &self.typing
    }

    /// Read-receipt batcher.
    pub fn receipts(&self) -> &ReadReceiptBatcher<E> {
        &self.receipts
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<RealtimeMetrics> {
        &self.metrics
    }

    /// Leave a conversation.
    ///
    /// Flushes pending read receipts (after any flush already in flight for
    /// the conversation), drops typing state without publishing,
    /// removes listeners and unsubscribes the channel. If persisting the
    /// flush fails, the batch stays pending for a later
    /// `flush_pending_read_receipts` and the error is returned after the
    /// rest of the teardown.
    pub async fn leave_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<FlushOutcome, SyncError> {
        let flushed = self.receipts.flush_pending_read_receipts(conversation_id).await;

        self.typing.unsubscribe(conversation_id);
        match &flushed {
            Ok(_) => self.receipts.unsubscribe(conversation_id),
            Err(error) => {
                warn!(conversation = %conversation_id, error = %error, "leaving with unflushed reads");
            },
        }
        self.connection.unsubscribe(conversation_id).await;

        info!(conversation = %conversation_id, "left conversation");
        flushed
    }

    /// Hard teardown: drop every pending batch and typing state, unsubscribe
    /// everything and log final metrics.
    pub async fn shutdown(&self) {
        self.typing.unsubscribe_all();
        self.receipts.unsubscribe_all();
        self.connection.shutdown().await;
        self.metrics.log_metrics();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(SyncConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_batch_delay_rejected() {
        let mut config = SyncConfig::default();
        config.receipts.batch_delay = Duration::ZERO;

        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration { field: "receipts.batch_delay" })
        );
    }

    #[test]
    fn zero_attempt_budget_rejected() {
        let mut config = SyncConfig::default();
        config.connection.max_reconnect_attempts = 0;

        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroCapacity { field: "connection.max_reconnect_attempts" })
        );
    }

    #[test]
    fn debounce_must_be_shorter_than_timeout() {
        let mut config = SyncConfig::default();
        config.typing.debounce = Duration::from_secs(3);

        assert!(matches!(config.validate(), Err(ConfigError::DebounceExceedsTimeout { .. })));
    }
}
