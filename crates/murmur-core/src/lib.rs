//! Realtime synchronization core.
//!
//! Keeps per-conversation "typing" and "read" signals flowing over a shared
//! realtime transport while tolerating flaky connectivity.
//!
//! # Components
//!
//! - [`ConnectionManager`]: one channel per conversation, reconnection with
//!   exponential backoff, polling fallback when retries are exhausted
//! - [`TypingCoordinator`]: debounced "start typing", automatic "stop typing"
//! - [`ReadReceiptBatcher`]: time-batched, de-duplicated read receipts,
//!   persisted before they are broadcast
//! - [`RealtimeMetrics`]: counters and rolling latency
//! - [`RealtimeSync`]: all of the above wired together
//!
//! # Collaborators
//!
//! The transport ([`RealtimeTransport`]), read-state store
//! ([`ReadStateStore`]) and privacy settings ([`Preferences`]) are traits
//! implemented by the host application.
//!
//! # Time
//!
//! Every timer sleeps through an [`Environment`]. [`SystemEnv`] uses tokio
//! time, so tests run under a paused clock.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod connection;
pub mod env;
pub mod error;
pub mod metrics;
pub mod preferences;
pub mod receipts;
pub mod service;
pub mod storage;
mod system_env;
pub mod timer;
pub mod transport;
pub mod typing;

pub use connection::{
    BroadcastListener, ConnectionConfig, ConnectionManager, ConnectionState, ObserverId,
    PublishOutcome, StateObserver, StateTransition,
};
pub use env::Environment;
pub use error::{ConfigError, StorageError, SyncError, TransportError};
pub use metrics::{FailureCategory, MetricsConfig, MetricsSnapshot, RealtimeMetrics};
pub use preferences::{ChatPreferences, Preferences};
pub use receipts::{FlushOutcome, ReadReceiptBatcher, ReadReceiptCallback, ReceiptConfig};
pub use service::{RealtimeSync, SyncConfig};
pub use storage::ReadStateStore;
pub use system_env::SystemEnv;
pub use timer::KeyedTimers;
pub use transport::{BroadcastHandler, RealtimeChannel, RealtimeTransport};
pub use typing::{TypingCallback, TypingConfig, TypingCoordinator};
