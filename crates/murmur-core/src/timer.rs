//! Keyed, cancellable one-shot timers.
//!
//! Debounce expiry, batch flushes and reconnection backoff all need "at most
//! one pending timer per key, and starting a new one replaces the old".
//! [`KeyedTimers`] provides exactly that on top of spawned tokio tasks.
//!
//! # Invariants
//!
//! - At most one live timer per key. `schedule` aborts the previous task for
//!   the key while holding the key's shard lock, so two timers for one key
//!   never coexist.
//! - Every timer carries a generation. Before running its effect a task must
//!   remove its own slot with a matching generation. A task whose slot was
//!   replaced or cancelled never runs its effect, even if the abort arrives
//!   after its sleep completed.
//! - Once an effect has claimed its slot, `cancel` and `schedule` for that key
//!   no longer affect it.

use std::{
    future::Future,
    hash::Hash,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::task::AbortHandle;

use crate::env::Environment;

struct TimerSlot {
    generation: u64,
    handle: AbortHandle,
}

/// One-shot timers keyed by `K`.
///
/// Create with [`KeyedTimers::new`], which returns an `Arc` because pending
/// tasks hold a weak reference back to the registry to claim their slot.
pub struct KeyedTimers<K>
where
    K: Eq + Hash,
{
    slots: DashMap<K, TimerSlot>,
    next_generation: AtomicU64,
}

impl<K> KeyedTimers<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create an empty timer registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slots: DashMap::new(), next_generation: AtomicU64::new(1) })
    }

    /// Run `effect` after `delay` unless replaced or cancelled first.
    ///
    /// Replaces (and aborts) any pending timer for `key`. Returns the new
    /// timer's generation.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<E, F, Fut>(self: &Arc<Self>, env: &E, key: K, delay: Duration, effect: F) -> u64
    where
        E: Environment,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry: Weak<Self> = Arc::downgrade(self);
        let env = env.clone();
        let task_key = key.clone();

        let task = async move {
            env.sleep(delay).await;

            let Some(timers) = registry.upgrade() else {
                return;
            };
            let claimed =
                timers.slots.remove_if(&task_key, |_, slot| slot.generation == generation);
            drop(timers);

            if claimed.is_some() {
                effect().await;
            }
        };

        match self.slots.entry(key) {
            Entry::Occupied(mut occupied) => {
                let handle = tokio::spawn(task).abort_handle();
                let previous = occupied.insert(TimerSlot { generation, handle });
                previous.handle.abort();
            },
            Entry::Vacant(vacant) => {
                let handle = tokio::spawn(task).abort_handle();
                vacant.insert(TimerSlot { generation, handle });
            },
        }

        generation
    }

    /// Cancel the pending timer for `key`. Returns `true` if one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.slots.remove(key) {
            Some((_, slot)) => {
                slot.handle.abort();
                true
            },
            None => false,
        }
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&self) {
        self.slots.retain(|_, slot| {
            slot.handle.abort();
            false
        });
    }

    /// Whether a timer for `key` is pending (scheduled and not yet claimed).
    pub fn is_pending(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of pending timers.
    pub fn pending_count(&self) -> usize {
        self.slots.len()
    }
}

impl<K> Drop for KeyedTimers<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            slot.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::SystemEnv;

    fn adder(
        counter: &Arc<AtomicUsize>,
        n: usize,
    ) -> impl FnOnce() -> std::future::Ready<()> + Send + use<> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(n, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timers = KeyedTimers::new();
        let counter = Arc::new(AtomicUsize::new(0));

        timers.schedule(&SystemEnv, "a", Duration::from_millis(100), adder(&counter, 1));
        assert!(timers.is_pending(&"a"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!timers.is_pending(&"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_previous() {
        let timers = KeyedTimers::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = timers.schedule(&SystemEnv, "a", Duration::from_millis(100), adder(&counter, 1));
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second =
            timers.schedule(&SystemEnv, "a", Duration::from_millis(100), adder(&counter, 10));
        assert!(second > first);
        assert_eq!(timers.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0, "replaced timer must not fire");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_effect() {
        let timers = KeyedTimers::new();
        let counter = Arc::new(AtomicUsize::new(0));

        timers.schedule(&SystemEnv, "a", Duration::from_millis(100), adder(&counter, 1));
        assert!(timers.cancel(&"a"));
        assert!(!timers.cancel(&"a"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let timers = KeyedTimers::new();
        let counter = Arc::new(AtomicUsize::new(0));

        timers.schedule(&SystemEnv, "a", Duration::from_millis(100), adder(&counter, 1));
        timers.schedule(&SystemEnv, "b", Duration::from_millis(100), adder(&counter, 10));
        timers.cancel(&"a");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_everything() {
        let timers = KeyedTimers::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            timers.schedule(&SystemEnv, key, Duration::from_millis(100), adder(&counter, 1));
        }
        assert_eq!(timers.pending_count(), 3);

        timers.cancel_all();
        assert_eq!(timers.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_registry_never_fires() {
        let timers = KeyedTimers::new();
        let counter = Arc::new(AtomicUsize::new(0));

        timers.schedule(&SystemEnv, "a", Duration::from_millis(100), adder(&counter, 1));
        drop(timers);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
