//! Reconnection backoff policy.
//!
//! The attempt counter counts consecutive failures, the initial subscribe
//! included. Failure `f` (1-based) schedules reconnection attempt `f - 1`
//! after `base * 2^(f - 1)`. Once `f` reaches the attempt budget the
//! conversation degrades to polling instead.

use std::time::Duration;

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Schedule reconnection attempt `attempt` after `delay`
    Retry {
        /// Zero-based reconnection attempt number
        attempt: u32,
        /// Time to wait before the attempt
        delay: Duration,
    },
    /// Budget exhausted. Stop retrying and enable polling fallback.
    Fallback,
}

/// Delay before reconnection attempt `attempt`: `base * 2^attempt`.
///
/// Uncapped within the attempt budget. Saturates instead of overflowing.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt).map_or(Duration::MAX, |factor| base.saturating_mul(factor))
}

/// Decide the reaction to the `failures`-th consecutive failure.
pub fn next_action(failures: u32, max_attempts: u32, base: Duration) -> FailureAction {
    if failures >= max_attempts {
        return FailureAction::Fallback;
    }
    let attempt = failures.saturating_sub(1);
    FailureAction::Retry { attempt, delay: reconnect_delay(base, attempt) }
}
