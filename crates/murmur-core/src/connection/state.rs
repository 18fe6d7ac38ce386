//! Connection states and per-conversation status.

use murmur_proto::ConversationId;

use super::queue::DegradedQueue;

/// Connection state of one conversation channel, or of the manager as a
/// whole.
///
/// # State Machine
///
/// ```text
/// Disconnected -> Connecting -> Connected
///                     |             |
///                     v             v
///                   Error <---------+
///                   |   |
///     (retry) <-----+   +-----> Disconnected (polling fallback)
/// ```
///
/// Any state moves to `Disconnected` on explicit unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No subscription
    #[default]
    Disconnected,
    /// Subscribe in flight
    Connecting,
    /// Subscribed and usable
    Connected,
    /// Last subscribe or publish failed
    Error(String),
}

impl ConnectionState {
    /// Whether the channel is subscribed.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether the channel is in the error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Precedence when folding many channel states into one.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Connected => 3,
            Self::Connecting => 2,
            Self::Error(_) => 1,
            Self::Disconnected => 0,
        }
    }
}

/// A state change of one conversation channel, delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    /// Conversation whose channel changed state
    pub conversation_id: ConversationId,
    /// Previous state
    pub from: ConnectionState,
    /// New state
    pub to: ConnectionState,
}

/// Mutable bookkeeping of one conversation channel.
///
/// Guarded by a synchronous mutex that is never held across an await.
#[derive(Debug)]
pub(crate) struct ChannelStatus<I> {
    pub(crate) state: ConnectionState,
    /// Consecutive failures since the last success
    pub(crate) attempts: u32,
    /// Last successful subscribe or publish
    pub(crate) last_success: Option<I>,
    pub(crate) polling_fallback: bool,
    /// Set once the slot has been unsubscribed. A retired slot is never
    /// reconnected.
    pub(crate) retired: bool,
    pub(crate) queue: DegradedQueue,
}

impl<I> ChannelStatus<I> {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_success: None,
            polling_fallback: false,
            retired: false,
            queue: DegradedQueue::default(),
        }
    }
}
