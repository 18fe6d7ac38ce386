//! Error types for the realtime synchronization core.
//!
//! Errors are split by collaborator: transport errors come from the realtime
//! transport, storage errors from the read-state store, configuration errors
//! from [`SyncConfig::validate`](crate::SyncConfig::validate). [`SyncError`]
//! is what public operations return.

use std::time::Duration;

use murmur_proto::ProtocolError;
use thiserror::Error;

/// Errors reported by the realtime transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Subscribe or publish did not complete in time
    #[error("timed out after {elapsed:?}")]
    Timeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Credentials were rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Connectivity failure
    #[error("network error: {0}")]
    Network(String),

    /// Publish attempted on a channel that is not subscribed
    #[error("channel {0} is not subscribed")]
    NotSubscribed(String),

    /// Channel was closed by the transport
    #[error("channel {0} closed")]
    Closed(String),

    /// Any other transport failure
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Authorization failures are not transient, but they still go through
    /// the same retry budget because the transport does not reliably
    /// distinguish causes.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network(_) | Self::Closed(_))
    }

    /// Reason string carried by `ConnectionState::Error`.
    pub fn reason(&self) -> String {
        match self {
            Self::Timeout { .. } => "Connection timeout".to_string(),
            Self::Network(_) => "Network error".to_string(),
            Self::Unauthorized(_) => "Authentication error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Errors reported by the read-state store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// I/O failure (connection refused, timeout, ...)
    #[error("storage I/O error: {0}")]
    Io(String),

    /// The backend refused the write
    #[error("storage rejected write: {0}")]
    Rejected(String),
}

impl StorageError {
    /// Returns true if retrying the same write may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Invalid configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that must be positive is zero
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Offending field
        field: &'static str,
    },

    /// A capacity or count that must be positive is zero
    #[error("{field} must be greater than zero")]
    ZeroCapacity {
        /// Offending field
        field: &'static str,
    },

    /// Typing debounce is not shorter than the typing timeout
    #[error("typing debounce {debounce:?} must be shorter than typing timeout {timeout:?}")]
    DebounceExceedsTimeout {
        /// Configured debounce
        debounce: Duration,
        /// Configured timeout
        timeout: Duration,
    },
}

/// Errors returned by the public operations of the core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Realtime transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Read-state persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Payload encoding or decoding failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_transient(),
            Self::Storage(e) => e.is_transient(),
            Self::Protocol(_) | Self::Config(_) => false,
        }
    }
}
