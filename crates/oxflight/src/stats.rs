//! Deduplication statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing how a coalescer has been used.
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct CoalescerStats {
    /// Number of callers that executed work themselves.
    pub owners: AtomicU64,
    /// Number of callers that reused another caller's execution.
    pub joiners: AtomicU64,
    /// Number of flights that finished (normally or by panic).
    pub completed: AtomicU64,
    /// Number of flights whose work function panicked.
    pub panicked: AtomicU64,
    /// Number of joiners that stopped waiting before the flight finished.
    pub timeouts: AtomicU64,
    /// Number of async flights whose owner was dropped before finishing.
    pub abandoned: AtomicU64,
}

impl CoalescerStats {
    /// Create new empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a caller becoming owner of a flight.
    #[inline]
    pub fn record_owner(&self) {
        self.owners.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a caller joining an in-flight call.
    #[inline]
    pub fn record_joiner(&self) {
        self.joiners.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed flight.
    #[inline]
    pub fn record_complete(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flight whose work panicked.
    #[inline]
    pub fn record_panic(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a joiner giving up on its wait.
    #[inline]
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an owner dropped mid-flight.
    #[inline]
    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of callers that were deduplicated (joiners).
    pub fn dedup_ratio(&self) -> f64 {
        self.snapshot().dedup_ratio()
    }

    /// Get current snapshot of the counters.
    pub fn snapshot(&self) -> CoalescerStatsSnapshot {
        CoalescerStatsSnapshot {
            owners: self.owners.load(Ordering::Relaxed),
            joiners: self.joiners.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.owners.store(0, Ordering::Relaxed);
        self.joiners.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.panicked.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.abandoned.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`CoalescerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoalescerStatsSnapshot {
    pub owners: u64,
    pub joiners: u64,
    pub completed: u64,
    pub panicked: u64,
    pub timeouts: u64,
    pub abandoned: u64,
}

impl CoalescerStatsSnapshot {
    /// Total callers seen (owners plus joiners).
    pub fn requests(&self) -> u64 {
        self.owners + self.joiners
    }

    /// Fraction of callers that were deduplicated (joiners).
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.requests();
        if total == 0 {
            0.0
        } else {
            self.joiners as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ratio() {
        let stats = CoalescerStats::new();
        assert!(stats.dedup_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn test_dedup_ratio() {
        let stats = CoalescerStats::new();
        stats.record_owner();
        stats.record_joiner();
        stats.record_joiner();

        // 2 joiners / 3 total = 0.666...
        assert!((stats.dedup_ratio() - 0.666).abs() < 0.01);
        assert_eq!(stats.snapshot().requests(), 3);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let stats = CoalescerStats::new();
        stats.record_owner();
        stats.record_complete();
        stats.record_panic();
        stats.record_timeout();
        stats.record_abandoned();

        let snapshot = stats.snapshot();
        assert_eq!(
            snapshot,
            CoalescerStatsSnapshot {
                owners: 1,
                joiners: 0,
                completed: 1,
                panicked: 1,
                timeouts: 1,
                abandoned: 1,
            }
        );

        stats.reset();
        assert_eq!(stats.snapshot(), CoalescerStatsSnapshot::default());
    }
}
