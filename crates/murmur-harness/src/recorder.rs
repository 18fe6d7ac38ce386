//! Connection state transition recorder.

#![allow(clippy::disallowed_types, reason = "Observers are synchronous callbacks")]

use std::sync::{Arc, Mutex, MutexGuard};

use murmur_core::{ConnectionState, StateObserver, StateTransition};
use murmur_proto::ConversationId;

/// Collects every transition reported to its observer.
#[derive(Clone, Default)]
pub struct TransitionRecorder {
    transitions: Arc<Mutex<Vec<StateTransition>>>,
}

impl TransitionRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, Vec<StateTransition>> {
        self.transitions.lock().expect("Mutex poisoned")
    }

    /// Observer to register with a connection manager.
    pub fn observer(&self) -> StateObserver {
        let transitions = Arc::clone(&self.transitions);
        Arc::new(move |transition: &StateTransition| {
            #[allow(clippy::expect_used)]
            transitions.lock().expect("Mutex poisoned").push(transition.clone());
        })
    }

    /// Every transition seen, in order.
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.lock().clone()
    }

    /// Target states for one conversation, in order.
    pub fn states_of(&self, conversation_id: &ConversationId) -> Vec<ConnectionState> {
        self.lock()
            .iter()
            .filter(|transition| transition.conversation_id == *conversation_id)
            .map(|transition| transition.to.clone())
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
