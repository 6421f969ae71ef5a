//! # Engine Statistics
//!
//! Provide lightweight counters for both lookup engines: how many calls were
//! made, how many attempts and retries they cost, and how replies were
//! disposed of.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply.
//! 2. **Relaxed Ordering**: Counters are independent; no cross-field ordering.
//! 3. **Plain Snapshots**: `snapshot()` copies values into a plain struct.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Sync queries issued.
    pub queries: u64,
    /// Transport attempts across both engines (first sends included).
    pub attempts: u64,
    /// Resends caused by a server death.
    pub retries: u64,
    /// Replies refused because of their sender credential.
    pub untrusted: u64,
    /// Replies that failed to decode.
    pub malformed: u64,
    /// Async requests registered in the worklist.
    pub async_started: u64,
    /// Async requests that reached a terminal result.
    pub async_completed: u64,
    /// Async requests removed by `cancel`.
    pub async_cancelled: u64,
    /// Replies or death notices for untracked channels.
    pub mismatches: u64,
}

/// Shared counters for one endpoint.
#[derive(Debug, Default)]
pub struct EngineStats {
    queries: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    untrusted: AtomicU64,
    malformed: AtomicU64,
    async_started: AtomicU64,
    async_completed: AtomicU64,
    async_cancelled: AtomicU64,
    mismatches: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        EngineStats::default()
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_untrusted(&self) {
        self.untrusted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_async_start(&self) {
        self.async_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_async_complete(&self) {
        self.async_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_async_cancel(&self) {
        self.async_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mismatch(&self) {
        self.mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            untrusted: self.untrusted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            async_started: self.async_started.load(Ordering::Relaxed),
            async_completed: self.async_completed.load(Ordering::Relaxed),
            async_cancelled: self.async_cancelled.load(Ordering::Relaxed),
            mismatches: self.mismatches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_records() {
        let stats = EngineStats::new();
        stats.record_query();
        stats.record_attempt();
        stats.record_attempt();
        stats.record_retry();
        stats.record_mismatch();
        let snap = stats.snapshot();
        assert_eq!(snap.queries, 1);
        assert_eq!(snap.attempts, 2);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.mismatches, 1);
        assert_eq!(snap.async_started, 0);
    }
}
