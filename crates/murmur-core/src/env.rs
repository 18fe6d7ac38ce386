//! Environment abstraction for deterministic testing.
//!
//! Decouples timer and latency logic from the system clock. Production uses
//! [`SystemEnv`](crate::SystemEnv); tests run the same code under tokio's
//! paused clock so debounce, batching and backoff delays are exact.

use std::{future::Future, ops::Sub, time::Duration};

/// Abstract environment providing time and async sleeping.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - `sleep(d)` completes no earlier than `d` after it was awaited
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    ///
    /// Production uses `tokio::time::Instant` so that a paused runtime
    /// controls both timers and measured latencies.
    type Instant: Copy + Ord + Send + Sync + 'static + Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only timer tasks sleep. Component logic never blocks on time.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Milliseconds since the Unix epoch, used to stamp outgoing payloads.
    ///
    /// Not monotonic. Never use it for timer arithmetic.
    fn wall_clock_millis(&self) -> u64;
}
