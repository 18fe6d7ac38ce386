//! Counters and rolling latency for the realtime core.
//!
//! [`RealtimeMetrics`] is a pure sink: recording never blocks on I/O, never
//! fails and never feeds back into the components that record into it.
//! Readers take an immutable [`MetricsSnapshot`].

#![allow(clippy::disallowed_types, reason = "Short synchronous critical sections only")]

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Default number of latency samples kept for the rolling average.
pub const DEFAULT_LATENCY_WINDOW: usize = 100;

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Capacity of the rolling latency window
    pub latency_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { latency_window: DEFAULT_LATENCY_WINDOW }
    }
}

/// What kind of operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// Typing broadcast failed to publish
    Typing,
    /// Read-receipt broadcast failed to publish
    ReadReceipt,
    /// Automatic or explicit reconnection failed
    Reconnection,
    /// Read state could not be persisted
    Persistence,
}

impl FailureCategory {
    const ALL: [Self; 4] = [Self::Typing, Self::ReadReceipt, Self::Reconnection, Self::Persistence];

    const fn index(self) -> usize {
        match self {
            Self::Typing => 0,
            Self::ReadReceipt => 1,
            Self::Reconnection => 2,
            Self::Persistence => 3,
        }
    }
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Fixed-capacity window of latency samples with an exact running sum.
///
/// The sum is kept in `u128` nanoseconds: even a window of `Duration::MAX`
/// samples cannot overflow it.
#[derive(Debug)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
    sum_nanos: u128,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { samples: VecDeque::with_capacity(capacity), capacity, sum_nanos: 0 }
    }

    fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity
            && let Some(oldest) = self.samples.pop_front()
        {
            self.sum_nanos -= oldest.as_nanos();
        }
        self.samples.push_back(sample);
        self.sum_nanos += sample.as_nanos();
    }

    fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        // The mean never exceeds the largest sample, so it fits a Duration
        let mean = self.sum_nanos / self.samples.len() as u128;
        let secs = u64::try_from(mean / NANOS_PER_SEC).unwrap_or(u64::MAX);
        Duration::new(secs, (mean % NANOS_PER_SEC) as u32)
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.sum_nanos = 0;
    }
}

/// Shared metrics recorder.
///
/// Every failure recorded also counts as a processed event, so the success
/// rate stays within `[0, 1]`.
#[derive(Debug)]
pub struct RealtimeMetrics {
    typing_events_sent: AtomicU64,
    read_receipts_sent: AtomicU64,
    successful_reconnections: AtomicU64,
    failures: [AtomicU64; 4],
    polling_fallback_activations: AtomicU64,
    queued_events: AtomicU64,
    total_events_processed: AtomicU64,
    total_connection_ms: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl RealtimeMetrics {
    /// Create a recorder with the given configuration.
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            typing_events_sent: AtomicU64::new(0),
            read_receipts_sent: AtomicU64::new(0),
            successful_reconnections: AtomicU64::new(0),
            failures: Default::default(),
            polling_fallback_activations: AtomicU64::new(0),
            queued_events: AtomicU64::new(0),
            total_events_processed: AtomicU64::new(0),
            total_connection_ms: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow::new(config.latency_window)),
        }
    }

    /// A typing broadcast was published.
    pub fn record_typing_event_sent(&self, latency: Option<Duration>) {
        self.typing_events_sent.fetch_add(1, Ordering::Relaxed);
        self.total_events_processed.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency {
            self.record_latency(latency);
        }
    }

    /// A read-receipt broadcast covering `message_count` messages was published.
    pub fn record_read_receipt_sent(&self, message_count: usize, latency: Option<Duration>) {
        self.read_receipts_sent.fetch_add(1, Ordering::Relaxed);
        self.total_events_processed.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency {
            self.record_latency(latency);
        }
        tracing::trace!(message_count, "read receipt recorded");
    }

    /// A reconnection attempt finished.
    pub fn record_reconnection(&self, successful: bool) {
        if successful {
            self.successful_reconnections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.record_failed_event(FailureCategory::Reconnection);
        }
    }

    /// An operation of the given category failed.
    pub fn record_failed_event(&self, category: FailureCategory) {
        self.failures[category.index()].fetch_add(1, Ordering::Relaxed);
        self.total_events_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a latency sample, evicting the oldest if the window is full.
    pub fn record_latency(&self, latency: Duration) {
        self.latency.lock().unwrap_or_else(PoisonError::into_inner).push(latency);
    }

    /// A conversation entered polling fallback.
    pub fn record_polling_fallback_activation(&self) {
        self.polling_fallback_activations.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the number of broadcasts currently queued while degraded.
    pub fn update_queued_events(&self, count: usize) {
        self.queued_events.store(count as u64, Ordering::Relaxed);
    }

    /// Add a span with at least one connected channel.
    ///
    /// The connection manager measures the span on its environment clock.
    pub fn record_connection_time(&self, uptime: Duration) {
        let millis = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX);
        // The closure never declines, so the update always lands
        let _ = self.total_connection_ms.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
            Some(total.saturating_add(millis))
        });
    }

    /// Failures recorded for one category.
    pub fn failures(&self, category: FailureCategory) -> u64 {
        self.failures[category.index()].load(Ordering::Relaxed)
    }

    /// Current average of the latency window.
    pub fn average_latency(&self) -> Duration {
        self.latency.lock().unwrap_or_else(PoisonError::into_inner).average()
    }

    /// Immutable copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (average_latency, latency_samples) = {
            let window = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
            (window.average(), window.samples.len())
        };

        MetricsSnapshot {
            typing_events_sent: self.typing_events_sent.load(Ordering::Relaxed),
            read_receipts_sent: self.read_receipts_sent.load(Ordering::Relaxed),
            successful_reconnections: self.successful_reconnections.load(Ordering::Relaxed),
            failed_reconnections: self.failures(FailureCategory::Reconnection),
            failed_typing: self.failures(FailureCategory::Typing),
            failed_read_receipts: self.failures(FailureCategory::ReadReceipt),
            failed_persistence: self.failures(FailureCategory::Persistence),
            polling_fallback_activations: self.polling_fallback_activations.load(Ordering::Relaxed),
            queued_events: self.queued_events.load(Ordering::Relaxed),
            total_events_processed: self.total_events_processed.load(Ordering::Relaxed),
            total_connection_time: Duration::from_millis(
                self.total_connection_ms.load(Ordering::Relaxed),
            ),
            average_latency,
            latency_samples,
        }
    }

    /// Zero every counter and clear the latency window.
    pub fn reset(&self) {
        for counter in [
            &self.typing_events_sent,
            &self.read_receipts_sent,
            &self.successful_reconnections,
            &self.polling_fallback_activations,
            &self.queued_events,
            &self.total_events_processed,
            &self.total_connection_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for category in FailureCategory::ALL {
            self.failures[category.index()].store(0, Ordering::Relaxed);
        }
        self.latency.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Emit the current snapshot through `tracing`.
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            typing_events_sent = snapshot.typing_events_sent,
            read_receipts_sent = snapshot.read_receipts_sent,
            successful_reconnections = snapshot.successful_reconnections,
            failed_reconnections = snapshot.failed_reconnections,
            failed_events = snapshot.failed_events(),
            average_latency_ms = snapshot.average_latency.as_millis() as u64,
            success_rate = snapshot.success_rate(),
            polling_fallback_activations = snapshot.polling_fallback_activations,
            queued_events = snapshot.queued_events,
            total_connection_ms = snapshot.total_connection_time.as_millis() as u64,
            "realtime metrics"
        );
    }
}

impl Default for RealtimeMetrics {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}

/// Point-in-time copy of [`RealtimeMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Typing broadcasts published
    pub typing_events_sent: u64,
    /// Read-receipt broadcasts published
    pub read_receipts_sent: u64,
    /// Reconnections that succeeded
    pub successful_reconnections: u64,
    /// Reconnections that failed
    pub failed_reconnections: u64,
    /// Typing publishes that failed
    pub failed_typing: u64,
    /// Read-receipt publishes that failed
    pub failed_read_receipts: u64,
    /// Read-state persistence failures
    pub failed_persistence: u64,
    /// Times a conversation entered polling fallback
    pub polling_fallback_activations: u64,
    /// Broadcasts queued while degraded
    pub queued_events: u64,
    /// Sent plus failed events
    pub total_events_processed: u64,
    /// Accumulated time with at least one connected channel
    pub total_connection_time: Duration,
    /// Mean of the latency window
    pub average_latency: Duration,
    /// Samples currently in the latency window
    pub latency_samples: usize,
}

impl MetricsSnapshot {
    /// Failures across all categories.
    pub fn failed_events(&self) -> u64 {
        self.failed_typing
            + self.failed_read_receipts
            + self.failed_reconnections
            + self.failed_persistence
    }

    /// Reconnection attempts, successful or not.
    pub fn reconnections(&self) -> u64 {
        self.successful_reconnections + self.failed_reconnections
    }

    /// `(processed - failed) / processed`, or `1.0` when nothing was processed.
    pub fn success_rate(&self) -> f64 {
        if self.total_events_processed == 0 {
            return 1.0;
        }
        let succeeded = self.total_events_processed.saturating_sub(self.failed_events());
        succeeded as f64 / self.total_events_processed as f64
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Realtime Metrics:")?;
        writeln!(f, "- Typing events: {}", self.typing_events_sent)?;
        writeln!(f, "- Read receipts: {}", self.read_receipts_sent)?;
        writeln!(
            f,
            "- Reconnections: {} ({} failed)",
            self.reconnections(),
            self.failed_reconnections
        )?;
        writeln!(f, "- Avg latency: {}ms", self.average_latency.as_millis())?;
        writeln!(f, "- Success rate: {:.1}%", self.success_rate() * 100.0)?;
        writeln!(f, "- Polling fallbacks: {}", self.polling_fallback_activations)?;
        writeln!(f, "- Queued events: {}", self.queued_events)?;
        write!(f, "- Connection time: {}ms", self.total_connection_time.as_millis())
    }
}
