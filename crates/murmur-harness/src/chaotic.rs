//! Chaotic read-state store for fault injection.
//!
//! Wraps another store and fails writes at a configured rate so batching
//! code can be driven through persistence failures and re-queues.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use murmur_core::{ReadStateStore, StorageError};
use murmur_proto::{ConversationId, MessageId, UserId};

/// Store wrapper that randomly rejects writes.
///
/// Deterministic for a given seed. Clones share the RNG and counters.
#[derive(Clone)]
pub struct ChaoticReadStore<S: ReadStateStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<Lcg>>,
    operations: Arc<AtomicUsize>,
}

/// Linear congruential generator, Numerical Recipes constants.
struct Lcg {
    state: u64,
}

impl Lcg {
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1 << 32;

    /// Next value in [0.0, 1.0)
    fn next_unit(&mut self) -> f64 {
        self.state = Self::A.wrapping_mul(self.state).wrapping_add(Self::C) % Self::M;
        self.state as f64 / Self::M as f64
    }
}

impl<S: ReadStateStore> ChaoticReadStore<S> {
    /// Wrap `inner` with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x6d75_726d_7572)
    }

    /// Wrap `inner` with an explicit seed for reproducible runs.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(Lcg { state: seed })),
            operations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wrapped store, for checking what actually landed.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Writes attempted through this wrapper, failed or not.
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        #[allow(clippy::expect_used)]
        let mut rng = self.rng.lock().expect("Lcg mutex poisoned");
        rng.next_unit() < self.failure_rate
    }
}

#[async_trait]
impl<S: ReadStateStore> ReadStateStore for ChaoticReadStore<S> {
    async fn persist_read_state(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        message_ids: &[MessageId],
    ) -> Result<(), StorageError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        self.inner.persist_read_state(conversation_id, user_id, message_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryReadStore;

    #[test]
    fn lcg_stays_in_unit_interval() {
        let mut rng = Lcg { state: 42 };
        for _ in 0..1_000 {
            let value = rng.next_unit();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[tokio::test]
    async fn zero_rate_never_fails_and_full_rate_always_fails() {
        let conversation = ConversationId::from("c1");
        let user = UserId::from("u1");

        let calm = ChaoticReadStore::new(MemoryReadStore::new(), 0.0);
        let stormy = ChaoticReadStore::new(MemoryReadStore::new(), 1.0);
        for i in 0..20 {
            let ids = [MessageId::new(format!("m{i}"))];
            assert!(calm.persist_read_state(&conversation, &user, &ids).await.is_ok());
            assert!(stormy.persist_read_state(&conversation, &user, &ids).await.is_err());
        }

        assert_eq!(calm.operation_count(), 20);
        assert_eq!(calm.inner().read_messages(&conversation, &user).len(), 20);
        assert_eq!(stormy.inner().persist_count(), 0);
    }

    #[test]
    #[should_panic(expected = "failure_rate must be between 0.0 and 1.0")]
    fn rejects_out_of_range_rate() {
        let _ = ChaoticReadStore::new(MemoryReadStore::new(), 1.5);
    }
}
