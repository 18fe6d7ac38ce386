//! Realtime transport collaborator.
//!
//! The transport is external: it provides named channels with subscribe,
//! publish and broadcast listeners, and delivers broadcasts within one
//! channel in publish order. Nothing here assumes ordering across channels.
//!
//! Only [`ConnectionManager`](crate::ConnectionManager) holds channel
//! handles. Other components publish through it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Callback invoked with the raw payload of an inbound broadcast.
pub type BroadcastHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Factory and owner of realtime channels.
#[async_trait]
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Create a fresh, unsubscribed channel.
    ///
    /// Always returns a new handle. A failed channel is never reused.
    fn open_channel(&self, name: &str) -> Arc<dyn RealtimeChannel>;

    /// Close a channel and release its server-side subscription.
    ///
    /// Closing an already closed channel is a no-op.
    async fn close_channel(&self, channel: Arc<dyn RealtimeChannel>);
}

/// A named publish/subscribe endpoint scoped to one conversation.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Channel name, e.g. `chat:<conversation>`.
    fn name(&self) -> &str;

    /// Join the channel.
    async fn subscribe(&self) -> Result<(), TransportError>;

    /// Publish a broadcast event to every subscriber of the channel.
    async fn publish(&self, event: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Register a handler for inbound broadcasts with the given event name.
    ///
    /// Handlers registered before `subscribe` receive every event delivered
    /// after the subscription completes.
    fn on_broadcast(&self, event: &str, handler: BroadcastHandler);
}
