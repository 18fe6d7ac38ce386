//! Scripted in-memory realtime transport.
//!
//! Every channel shares one state record, so a test holding a
//! [`SimTransport`] clone can script failures and inspect traffic for
//! channels the core creates internally.
//!
//! Failures are consumed in order: `fail_next_subscribes(3, ..)` makes the
//! next three `subscribe` calls fail, on whichever channels they happen.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use murmur_core::{BroadcastHandler, RealtimeChannel, RealtimeTransport, TransportError};
use murmur_proto::{Broadcast, EventKind};
use tokio::time::Instant;

/// One publish that reached the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    /// Channel name
    pub channel: String,
    /// Event name
    pub event: String,
    /// Raw payload
    pub payload: Bytes,
}

impl PublishedEvent {
    /// Decode the payload under its event name.
    ///
    /// # Panics
    ///
    /// Panics if the event name or payload is malformed. The core only
    /// publishes well-formed events, so a panic is a test failure.
    #[allow(clippy::expect_used)]
    pub fn decode(&self) -> Broadcast {
        let kind = EventKind::from_event_name(&self.event).expect("known event name");
        Broadcast::decode(kind, &self.payload).expect("well-formed payload")
    }
}

#[derive(Default)]
struct SimState {
    channels: Vec<Arc<SimChannel>>,
    opened: usize,
    closed: usize,
    subscribe_failures: VecDeque<TransportError>,
    fail_all_subscribes: Option<TransportError>,
    publish_failures: VecDeque<TransportError>,
    subscribe_attempts: Vec<(String, Instant)>,
    published: Vec<PublishedEvent>,
}

type SharedState = Arc<Mutex<SimState>>;

#[allow(clippy::expect_used)]
fn lock(state: &SharedState) -> MutexGuard<'_, SimState> {
    state.lock().expect("sim transport mutex poisoned")
}

/// In-memory realtime transport with scripted failures.
#[derive(Clone, Default)]
pub struct SimTransport {
    state: SharedState,
}

impl SimTransport {
    /// Transport where every operation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` subscribe calls with `error`.
    pub fn fail_next_subscribes(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        state.subscribe_failures.extend(std::iter::repeat_n(error, count));
    }

    /// Fail every subscribe call with `error` until [`heal`](Self::heal).
    pub fn fail_all_subscribes(&self, error: TransportError) {
        lock(&self.state).fail_all_subscribes = Some(error);
    }

    /// Fail the next `count` publish calls with `error`.
    pub fn fail_next_publishes(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        state.publish_failures.extend(std::iter::repeat_n(error, count));
    }

    /// Clear every scripted failure.
    pub fn heal(&self) {
        let mut state = lock(&self.state);
        state.subscribe_failures.clear();
        state.fail_all_subscribes = None;
        state.publish_failures.clear();
    }

    /// Number of subscribe calls, successful or not.
    pub fn subscribe_attempts(&self) -> usize {
        lock(&self.state).subscribe_attempts.len()
    }

    /// When each subscribe call happened.
    pub fn subscribe_attempt_times(&self) -> Vec<Instant> {
        lock(&self.state).subscribe_attempts.iter().map(|(_, at)| *at).collect()
    }

    /// Every publish that reached the transport, in order.
    pub fn published(&self) -> Vec<PublishedEvent> {
        lock(&self.state).published.clone()
    }

    /// Every published payload, decoded.
    pub fn published_broadcasts(&self) -> Vec<Broadcast> {
        self.published().iter().map(PublishedEvent::decode).collect()
    }

    /// Channels opened so far.
    pub fn opened_channels(&self) -> usize {
        lock(&self.state).opened
    }

    /// Channels closed so far.
    pub fn closed_channels(&self) -> usize {
        lock(&self.state).closed
    }

    /// Channels currently open.
    pub fn live_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Deliver a raw payload to every subscribed channel named `channel`
    /// with a handler for `event`. Returns the number of handlers invoked.
    pub fn deliver(&self, channel: &str, event: &str, payload: &Bytes) -> usize {
        let handlers: Vec<BroadcastHandler> = lock(&self.state)
            .channels
            .iter()
            .filter(|sim| sim.name == channel && sim.subscribed.load(Ordering::SeqCst))
            .flat_map(|sim| sim.handlers_for(event))
            .collect();

        for handler in &handlers {
            handler(payload.clone());
        }
        handlers.len()
    }

    /// Encode a broadcast and deliver it on its conversation's channel, as
    /// if a remote peer had published it.
    ///
    /// # Panics
    ///
    /// Panics if the broadcast fails to encode.
    #[allow(clippy::expect_used)]
    pub fn deliver_broadcast(&self, broadcast: &Broadcast) -> usize {
        let payload = broadcast.encode().expect("broadcast encodes");
        self.deliver(
            &broadcast.conversation_id().channel_name(),
            broadcast.kind().as_str(),
            &payload,
        )
    }
}

#[async_trait]
impl RealtimeTransport for SimTransport {
    fn open_channel(&self, name: &str) -> Arc<dyn RealtimeChannel> {
        let channel = Arc::new(SimChannel {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
        });

        let mut state = lock(&self.state);
        state.opened += 1;
        state.channels.push(Arc::clone(&channel));
        channel
    }

    async fn close_channel(&self, channel: Arc<dyn RealtimeChannel>) {
        let target = Arc::as_ptr(&channel).cast::<()>();
        let mut state = lock(&self.state);

        let Some(index) =
            state.channels.iter().position(|sim| Arc::as_ptr(sim).cast::<()>() == target)
        else {
            return;
        };
        let sim = state.channels.remove(index);
        sim.closed.store(true, Ordering::SeqCst);
        sim.subscribed.store(false, Ordering::SeqCst);
        state.closed += 1;
    }
}

struct SimChannel {
    name: String,
    state: SharedState,
    subscribed: AtomicBool,
    closed: AtomicBool,
    handlers: Mutex<Vec<(String, BroadcastHandler)>>,
}

impl SimChannel {
    #[allow(clippy::expect_used)]
    fn handlers_for(&self, event: &str) -> Vec<BroadcastHandler> {
        self.handlers
            .lock()
            .expect("sim channel mutex poisoned")
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

#[async_trait]
impl RealtimeChannel for SimChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.subscribe_attempts.push((self.name.clone(), Instant::now()));

        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.name.clone()));
        }
        if let Some(error) = state.fail_all_subscribes.clone() {
            return Err(error);
        }
        if let Some(error) = state.subscribe_failures.pop_front() {
            return Err(error);
        }

        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, event: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut state = lock(&self.state);

        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.name.clone()));
        }
        if !self.subscribed.load(Ordering::SeqCst) {
            return Err(TransportError::NotSubscribed(self.name.clone()));
        }
        if let Some(error) = state.publish_failures.pop_front() {
            return Err(error);
        }

        state.published.push(PublishedEvent {
            channel: self.name.clone(),
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn on_broadcast(&self, event: &str, handler: BroadcastHandler) {
        self.handlers
            .lock()
            .expect("sim channel mutex poisoned")
            .push((event.to_string(), handler));
    }
}
