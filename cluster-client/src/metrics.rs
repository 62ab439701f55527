//! Metrics collection for the batch executor and the connection pools
//!
//! Counters are plain atomics updated on the hot path; snapshots are cheap
//! copies taken on demand.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the batch executor
#[derive(Debug, Default)]
pub struct BatchMetrics {
    batches_executed: AtomicU64,
    batches_failed: AtomicU64,
    slot_retries: AtomicU64,
    redirects_followed: AtomicU64,
}

impl BatchMetrics {
    /// Creates a zeroed metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_batch(&self) {
        self.batches_executed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_batch_failure(&self) {
        self.batches_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_retry(&self) {
        self.slot_retries.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_redirect(&self) {
        self.redirects_followed.fetch_add(1, Ordering::SeqCst);
    }

    /// Takes a point-in-time copy of the counters
    pub fn snapshot(&self) -> BatchMetricsSnapshot {
        BatchMetricsSnapshot {
            batches_executed: self.batches_executed.load(Ordering::SeqCst),
            batches_failed: self.batches_failed.load(Ordering::SeqCst),
            slot_retries: self.slot_retries.load(Ordering::SeqCst),
            redirects_followed: self.redirects_followed.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time executor counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetricsSnapshot {
    /// Batches submitted for execution
    pub batches_executed: u64,
    /// Batches that completed exceptionally
    pub batches_failed: u64,
    /// Slot attempts that consumed retry budget
    pub slot_retries: u64,
    /// MOVED/ASK redirects followed
    pub redirects_followed: u64,
}

/// Counters maintained by a connection pool
#[derive(Debug, Default)]
pub struct PoolMetrics {
    connections_opened: AtomicU64,
    connection_failures: AtomicU64,
    quarantines: AtomicU64,
}

impl PoolMetrics {
    /// Creates a zeroed metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_open_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_quarantine(&self) {
        self.quarantines.fetch_add(1, Ordering::SeqCst);
    }

    /// Takes a point-in-time copy of the counters
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::SeqCst),
            connection_failures: self.connection_failures.load(Ordering::SeqCst),
            quarantines: self.quarantines.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetricsSnapshot {
    /// Connections opened successfully
    pub connections_opened: u64,
    /// Connection attempts that failed
    pub connection_failures: u64,
    /// Entries quarantined after hitting the failure threshold
    pub quarantines: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_metrics_counts() {
        let metrics = BatchMetrics::new();
        metrics.record_batch();
        metrics.record_batch();
        metrics.record_batch_failure();
        metrics.record_retry();
        metrics.record_redirect();

        let snap = metrics.snapshot();
        assert_eq!(snap.batches_executed, 2);
        assert_eq!(snap.batches_failed, 1);
        assert_eq!(snap.slot_retries, 1);
        assert_eq!(snap.redirects_followed, 1);
    }

    #[test]
    fn test_pool_metrics_counts() {
        let metrics = PoolMetrics::new();
        metrics.record_open();
        metrics.record_open_failure();
        metrics.record_open_failure();
        metrics.record_quarantine();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_opened, 1);
        assert_eq!(snap.connection_failures, 2);
        assert_eq!(snap.quarantines, 1);
    }
}
