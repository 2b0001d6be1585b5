//! Shared state machine plumbing: the one-transition-at-a-time guard and
//! the typed state-change emitter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StateTransitionError;

/// Guards a state machine against re-entrant transitions.
///
/// Every transition acquires a token first; a second acquisition while
/// the first is alive means some observer callback tried to transition
/// the same object again, which must fail with a loop error instead of
/// corrupting the machine. The token is released *before* observers are
/// notified, so observers may legally start the next transition.
#[derive(Debug)]
pub struct TransitionGuard {
    object: &'static str,
    in_transition: AtomicBool,
}

impl TransitionGuard {
    pub fn new(object: &'static str) -> Self {
        TransitionGuard {
            object,
            in_transition: AtomicBool::new(false),
        }
    }

    pub fn enter(&self) -> Result<TransitionToken<'_>, StateTransitionError> {
        if self.in_transition.swap(true, Ordering::SeqCst) {
            return Err(StateTransitionError::LoopDetected(self.object));
        }
        Ok(TransitionToken { guard: self })
    }
}

/// Proof that a transition is in flight; releases the guard on drop.
#[derive(Debug)]
pub struct TransitionToken<'a> {
    guard: &'a TransitionGuard,
}

impl TransitionToken<'_> {
    /// Releases the guard explicitly. Call before notifying observers.
    pub fn release(self) {}
}

impl Drop for TransitionToken<'_> {
    fn drop(&mut self) {
        self.guard.in_transition.store(false, Ordering::SeqCst);
    }
}

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// A typed state-change channel with synchronous fan-out.
///
/// Listeners run on the emitting task, after internal state is updated
/// and before pending futures resolve. The listener list is snapshotted
/// before dispatch so a listener may register further listeners.
pub struct StateEmitter<S> {
    listeners: Mutex<Vec<Listener<S>>>,
}

impl<S> StateEmitter<S> {
    pub fn new() -> Self {
        StateEmitter {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .expect("Lock failed")
            .push(Arc::new(listener));
    }

    pub fn emit(&self, state: &S) {
        let snapshot: Vec<Listener<S>> = self.listeners.lock().expect("Lock failed").clone();
        for listener in snapshot {
            listener(state);
        }
    }
}

impl<S> Default for StateEmitter<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reentrant_transition_is_a_loop() {
        let guard = TransitionGuard::new("test");

        let token = guard.enter().unwrap();
        let err = guard.enter().unwrap_err();

        assert_matches!(err, StateTransitionError::LoopDetected("test"));
        drop(token);
        assert!(guard.enter().is_ok());
    }

    #[test]
    fn test_release_before_observers_allows_next_transition() {
        let guard = TransitionGuard::new("test");

        let token = guard.enter().unwrap();
        token.release();

        // An observer running after release may start the next transition.
        assert!(guard.enter().is_ok());
    }

    #[test]
    fn test_emitter_synchronous_fanout() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let emitter = StateEmitter::new();
        let seen = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let seen = seen.clone();
            emitter.on(move |value: &u32| {
                seen.fetch_add(*value, Ordering::SeqCst);
            });
        }
        emitter.emit(&2);

        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_listener_may_register_listener() {
        let emitter: Arc<StateEmitter<u32>> = Arc::new(StateEmitter::new());

        let inner = emitter.clone();
        emitter.on(move |_: &u32| {
            inner.on(|_| {});
        });

        emitter.emit(&1);
        assert_eq!(emitter.listeners.lock().unwrap().len(), 2);
    }
}
