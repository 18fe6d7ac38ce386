//! Multicast registry for state-transition observers.

#![allow(clippy::disallowed_types, reason = "Observer list is only touched synchronously")]

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use super::state::StateTransition;

/// Callback invoked on every state transition.
pub type StateObserver = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// Handle returned by `add_observer`, used to remove the observer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Observers in registration order.
///
/// # Invariants
///
/// - Delivery follows registration order
/// - A panicking observer is logged and skipped. Later observers still run.
/// - The list lock is released before any observer runs, so observers may
///   add or remove observers.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, StateObserver)>>,
}

impl ObserverRegistry {
    pub(crate) fn add(&self, observer: StateObserver) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).push((id, observer));
        id
    }

    pub(crate) fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub(crate) fn clear(&self) {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn notify(&self, transition: &StateTransition) {
        let observers: Vec<StateObserver> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(transition))).is_err() {
                tracing::warn!(
                    conversation = %transition.conversation_id,
                    "state observer panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::connection::ConnectionState;

    fn transition() -> StateTransition {
        StateTransition {
            conversation_id: "c1".into(),
            from: ConnectionState::Connecting,
            to: ConnectionState::Connected,
        }
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let registry = ObserverRegistry::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        registry.add(Arc::new(move |_| first.lock().unwrap().push(1)));
        registry.add(Arc::new(|_| panic!("observer failure")));
        let third = Arc::clone(&order);
        registry.add(Arc::new(move |_| third.lock().unwrap().push(3)));

        registry.notify(&transition());

        assert_eq!(*order.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn removed_observer_is_not_called() {
        let registry = ObserverRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let id = registry.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        registry.notify(&transition());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 0);
    }
}
