//! Blocking single-flight coalescer.
//!
//! When multiple callers ask for the same key before the first one
//! finishes, only the first caller ("owner") runs the work function, on
//! its own thread. The others ("joiners") block until the owner publishes
//! the outcome and receive a copy of it.
//!
//! Nothing is cached past the flight: the owner unregisters the key
//! before waking the joiners, so any caller arriving after that point
//! starts a fresh execution.

use crate::call::Call;
use crate::config::CoalescerConfig;
use crate::error::WaitError;
use crate::outcome::{Execution, Outcome, Panicked};
use crate::stats::CoalescerStats;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Result of trying to attach to an in-flight call.
enum Attach<K, V, E> {
    /// No call was in flight; this caller must run the work.
    Owner { key: K, call: Arc<Call<V, E>> },
    /// A call was already in flight; wait for its outcome.
    Joiner(Arc<Call<V, E>>),
}

/// Deduplicates concurrent executions of work sharing a key.
///
/// Share one instance (typically behind an `Arc`) between every caller
/// that should coalesce together. Results are fanned out by cloning, so
/// large values and non-`Clone` errors are best wrapped in `Arc`.
///
/// # Example
///
/// ```
/// use oxflight::Coalescer;
///
/// let loader: Coalescer<&str, String, std::sync::Arc<std::io::Error>> = Coalescer::new();
/// let value = loader.execute("config", || Ok("loaded".to_string()));
/// assert_eq!(value.unwrap(), "loaded");
/// assert_eq!(loader.in_flight_count(), 0);
/// ```
pub struct Coalescer<K, V, E> {
    config: CoalescerConfig,
    /// Keys with work currently in flight.
    registry: DashMap<K, Arc<Call<V, E>>>,
    stats: CoalescerStats,
}

impl<K, V, E> Coalescer<K, V, E>
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

impl<K, V, E> Coalescer<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
    E: Clone,
{
    /// Run `work` for `key`, or wait for the run already in flight.
    ///
    /// Every caller of the same flight receives a clone of the same result.
    /// If `work` panics, the owner's panic is resumed and every joiner
    /// panics with a [`Panicked`] payload; the key is usable again either way.
    ///
    /// Calling this from inside `work` with the same key deadlocks.
    pub fn execute<F>(&self, key: K, work: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        self.execute_shared(key, work).result
    }

    /// Like [`execute`](Self::execute), also reporting the caller's role.
    pub fn execute_shared<F>(&self, key: K, work: F) -> Execution<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        match self.attach(key) {
            Attach::Owner { key, call } => self.own(&key, &call, work),
            Attach::Joiner(call) => call.wait().into_joined(),
        }
    }

    /// Like [`execute_shared`](Self::execute_shared), but a joiner gives up
    /// after `timeout`.
    ///
    /// The timeout only bounds waiting. An owner always runs `work` to
    /// completion, and a joiner that gives up does not disturb the flight.
    pub fn execute_timeout<F>(
        &self,
        key: K,
        timeout: Duration,
        work: F,
    ) -> Result<Execution<V, E>, WaitError>
    where
        F: FnOnce() -> Result<V, E>,
    {
        match self.attach(key) {
            Attach::Owner { key, call } => Ok(self.own(&key, &call, work)),
            Attach::Joiner(call) => match call.wait_timeout(timeout) {
                Some(outcome) => Ok(outcome.into_joined()),
                None => {
                    self.stats.record_timeout();
                    warn!(
                        coalescer = %self.config.name,
                        ?timeout,
                        "gave up waiting for in-flight call"
                    );
                    Err(WaitError::Timeout { waited: timeout })
                }
            },
        }
    }

    fn attach(&self, key: K) -> Attach<K, V, E> {
        match self.registry.entry(key) {
            Entry::Occupied(occupied) => {
                let call = Arc::clone(occupied.get());
                call.attach();
                drop(occupied);
                self.stats.record_joiner();
                debug!(coalescer = %self.config.name, "joining in-flight call");
                Attach::Joiner(call)
            }
            Entry::Vacant(vacant) => {
                let key = vacant.key().clone();
                let call = Arc::new(Call::new());
                vacant.insert(Arc::clone(&call));
                self.stats.record_owner();
                debug!(coalescer = %self.config.name, "starting new flight");
                Attach::Owner { key, call }
            }
        }
    }

    fn own<F>(&self, key: &K, call: &Arc<Call<V, E>>, work: F) -> Execution<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let started = Instant::now();
        // The joiners' copy is taken under the same unwind guard as the work,
        // so a panicking `Clone` is delivered like a panicking work function.
        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let returned = work();
            let published = returned.clone();
            (returned, published)
        }));
        let (result, outcome) = match caught {
            Ok((returned, published)) => (Ok(returned), Outcome::Returned(published)),
            Err(payload) => {
                let panicked = Panicked::from_payload(&self.config.name, payload.as_ref());
                (Err(payload), Outcome::Panicked(panicked))
            }
        };

        // Unregister before waking joiners so late callers start a new flight.
        self.registry.remove_if(key, |_, registered| Arc::ptr_eq(registered, call));
        let joiners = call.joiners();
        call.complete(outcome);
        self.stats.record_complete();

        match result {
            Ok(returned) => {
                trace!(
                    coalescer = %self.config.name,
                    joiners,
                    elapsed_us = started.elapsed().as_micros(),
                    "flight completed"
                );
                Execution::owned(returned, joiners)
            }
            Err(payload) => {
                self.stats.record_panic();
                warn!(coalescer = %self.config.name, joiners, "work function panicked");
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<K, V, E> Default for Coalescer<K, V, E>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> fmt::Debug for Coalescer<K, V, E>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("name", &self.config.name)
            .field("in_flight", &self.registry.len())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
