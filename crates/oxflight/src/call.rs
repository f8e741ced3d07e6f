//! In-flight call record for the blocking coalescer.

use crate::outcome::Outcome;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// One execution of a work function, shared by its owner and joiners.
///
/// The outcome slot goes from empty to filled exactly once, by the owner.
/// Filling it and waking waiters happen under the same lock, so a joiner
/// that sees the slot filled also sees everything the owner wrote before.
pub(crate) struct Call<V, E> {
    slot: Mutex<Option<Outcome<V, E>>>,
    done: Condvar,
    /// Joiners attached while the call was registered.
    joiners: AtomicUsize,
}

impl<V, E> Call<V, E> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            done: Condvar::new(),
            joiners: AtomicUsize::new(0),
        }
    }

    /// Register a joiner. Must be called while the registry entry is held.
    pub(crate) fn attach(&self) {
        self.joiners.fetch_add(1, Ordering::Relaxed);
    }

    /// Joiners attached so far. Final once the call left the registry.
    pub(crate) fn joiners(&self) -> usize {
        self.joiners.load(Ordering::Relaxed)
    }

    /// Publish the outcome and wake every waiter.
    pub(crate) fn complete(&self, outcome: Outcome<V, E>) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "call completed twice");
        *slot = Some(outcome);
        self.done.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<V: Clone, E: Clone> Call<V, E> {
    /// Block until the owner publishes the outcome.
    pub(crate) fn wait(&self) -> Outcome<V, E> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }

    /// Block until the outcome is published or `timeout` elapses.
    ///
    /// Giving up leaves the call untouched; the owner never notices.
    /// A timeout too large to be represented as a deadline waits forever.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<V, E>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                return slot.as_ref().cloned();
            }
        }
    }
}
