//! Single-flight coalescing for async work.
//!
//! Same contract as [`Coalescer`](crate::Coalescer), for work that is a
//! future. The owner drives the work future inline in its own task; joiners
//! await a broadcast of the outcome.
//!
//! An async owner can be dropped before its work finishes (its caller
//! stopped polling). The flight is then unregistered and its joiners start
//! over on the same key, either joining a newer flight or owning one.

use crate::config::CoalescerConfig;
use crate::error::WaitError;
use crate::outcome::{Execution, Outcome, Panicked};
use crate::stats::CoalescerStats;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Registry entry for an in-flight async call.
struct Flight<V, E> {
    /// Sender for broadcasting the outcome to joiners.
    sender: broadcast::Sender<Outcome<V, E>>,
    /// Number of joiners subscribed.
    joiners: AtomicUsize,
}

enum Attach<V, E> {
    Owner(Arc<Flight<V, E>>),
    Joiner(broadcast::Receiver<Outcome<V, E>>),
}

/// Unregisters a flight when the owner finishes or is dropped.
struct FlightGuard<'a, K, V, E>
where
    K: Hash + Eq,
{
    coalescer: &'a AsyncCoalescer<K, V, E>,
    key: &'a K,
    flight: &'a Arc<Flight<V, E>>,
    finished: bool,
}

impl<K, V, E> Drop for FlightGuard<'_, K, V, E>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        self.coalescer
            .registry
            .remove_if(self.key, |_, registered| Arc::ptr_eq(registered, self.flight));
        if !self.finished {
            self.coalescer.stats.record_abandoned();
            debug!(coalescer = %self.coalescer.config.name, "owner dropped before completing flight");
        }
    }
}

/// Deduplicates concurrent executions of async work sharing a key.
pub struct AsyncCoalescer<K, V, E> {
    config: CoalescerConfig,
    registry: DashMap<K, Arc<Flight<V, E>>>,
    stats: CoalescerStats,
}

impl<K, V, E> AsyncCoalescer<K, V, E>
where
    K: Hash + Eq,
{
    /// Create a coalescer with default configuration.
    pub fn new() -> Self {
        Self::with_config(CoalescerConfig::default())
    }

    /// Create a coalescer with the given configuration.
    pub fn with_config(config: CoalescerConfig) -> Self {
        Self {
            registry: config.build_registry(),
            config,
            stats: CoalescerStats::new(),
        }
    }

    /// Whether work for `key` is in flight right now.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.registry.contains_key(key)
    }

    /// Number of keys with work in flight.
    pub fn in_flight_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> &CoalescerStats {
        &self.stats
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }
}

impl<K, V, E> AsyncCoalescer<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
    E: Clone,
{
    /// Run `work` for `key`, or await the run already in flight.
    ///
    /// Panics in `work` are delivered the same way as
    /// [`Coalescer::execute`](crate::Coalescer::execute).
    pub async fn execute<F, Fut>(&self, key: K, work: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.execute_shared(key, work).await.result
    }

    /// Like [`execute`](Self::execute), also reporting the caller's role.
    pub async fn execute_shared<F, Fut>(&self, key: K, work: F) -> Execution<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let flight = loop {
            match self.attach(&key) {
                Attach::Owner(flight) => break flight,
                Attach::Joiner(mut receiver) => match receiver.recv().await {
                    Ok(outcome) => return outcome.into_joined(),
                    Err(_) => self.note_abandoned(),
                },
            }
        };
        self.own(&key, &flight, work).await
    }

    /// Like [`execute_shared`](Self::execute_shared), but a joiner gives up
    /// after `timeout`.
    ///
    /// The deadline covers the whole wait, including restarts after an
    /// abandoned flight. Owners are never timed out. A timeout too large to
    /// be represented as a deadline waits forever.
    pub async fn execute_timeout<F, Fut>(
        &self,
        key: K,
        timeout: Duration,
        work: F,
    ) -> Result<Execution<V, E>, WaitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let flight = loop {
            match self.attach(&key) {
                Attach::Owner(flight) => break flight,
                Attach::Joiner(mut receiver) => {
                    let received = match deadline {
                        Some(deadline) => tokio::time::timeout_at(deadline, receiver.recv()).await,
                        None => Ok(receiver.recv().await),
                    };
                    match received {
                        Ok(Ok(outcome)) => return Ok(outcome.into_joined()),
                        Ok(Err(_)) => self.note_abandoned(),
                        Err(_) => {
                            self.stats.record_timeout();
                            warn!(
                                coalescer = %self.config.name,
                                ?timeout,
                                "gave up waiting for in-flight call"
                            );
                            return Err(WaitError::Timeout { waited: timeout });
                        }
                    }
                }
            }
        };
        Ok(self.own(&key, &flight, work).await)
    }

    fn attach(&self, key: &K) -> Attach<V, E> {
        match self.registry.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let flight = occupied.get();
                flight.joiners.fetch_add(1, Ordering::Relaxed);
                // Subscribed under the shard lock, so the owner's send,
                // which follows its removal, cannot be missed.
                let receiver = flight.sender.subscribe();
                drop(occupied);
                self.stats.record_joiner();
                debug!(coalescer = %self.config.name, "joining in-flight call");
                Attach::Joiner(receiver)
            }
            Entry::Vacant(vacant) => {
                let (sender, _) = broadcast::channel(1);
                let flight = Arc::new(Flight {
                    sender,
                    joiners: AtomicUsize::new(0),
                });
                vacant.insert(Arc::clone(&flight));
                self.stats.record_owner();
                debug!(coalescer = %self.config.name, "starting new flight");
                Attach::Owner(flight)
            }
        }
    }

    async fn own<F, Fut>(&self, key: &K, flight: &Arc<Flight<V, E>>, work: F) -> Execution<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut guard = FlightGuard {
            coalescer: self,
            key,
            flight,
            finished: false,
        };

        let caught = AssertUnwindSafe(async move {
            let returned = work().await;
            let published = returned.clone();
            (returned, published)
        })
        .catch_unwind()
        .await;
        let (result, outcome) = match caught {
            Ok((returned, published)) => (Ok(returned), Outcome::Returned(published)),
            Err(payload) => {
                let panicked = Panicked::from_payload(&self.config.name, payload.as_ref());
                (Err(payload), Outcome::Panicked(panicked))
            }
        };

        // Unregister before broadcasting so late callers start a new flight.
        guard.finished = true;
        drop(guard);
        let joiners = flight.joiners.load(Ordering::Relaxed);
        // No receivers is fine: joiners may have timed out.
        let _ = flight.sender.send(outcome);
        self.stats.record_complete();

        match result {
            Ok(returned) => {
                trace!(coalescer = %self.config.name, joiners, "flight completed");
                Execution::owned(returned, joiners)
            }
            Err(payload) => {
                self.stats.record_panic();
                warn!(coalescer = %self.config.name, joiners, "work function panicked");
                panic::resume_unwind(payload)
            }
        }
    }

    /// The flight closed without an outcome: its owner was dropped.
    fn note_abandoned(&self) {
        trace!(coalescer = %self.config.name, "flight abandoned, retrying");
    }
}

impl<K, V, E> Default for AsyncCoalescer<K, V, E>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> fmt::Debug for AsyncCoalescer<K, V, E>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCoalescer")
            .field("name", &self.config.name)
            .field("in_flight", &self.registry.len())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
