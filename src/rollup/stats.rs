use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free engine counters.
///
/// Monotonic for the life of the engine; `snapshot()` reads without
/// resetting so several observers can poll independently.
#[derive(Debug, Default)]
pub struct EngineStats {
    samples_ingested: AtomicU64,
    late_dropped: AtomicU64,
    buckets_committed: AtomicU64,
    commit_retries: AtomicU64,
    commit_failures: AtomicU64,
    buckets_recovered: AtomicU64,
    samples_rejected: AtomicU64,
    mixed_kind_buckets: AtomicU64,
}

/// Point-in-time view of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub samples_ingested: u64,
    /// Bucket-level rejections: a sample late at one frequency may still be
    /// folded at a coarser one.
    pub late_dropped: u64,
    pub buckets_committed: u64,
    pub commit_retries: u64,
    /// Commits whose retry budget ran out (they keep retrying).
    pub commit_failures: u64,
    pub buckets_recovered: u64,
    /// NaN or infinite samples refused before folding.
    pub samples_rejected: u64,
    /// Committed buckets that folded samples of more than one kind.
    pub mixed_kind_buckets: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_ingested(&self, n: u64) {
        self.samples_ingested.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_late(&self, n: u64) {
        self.late_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_committed(&self) {
        self.buckets_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.commit_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovered(&self, n: u64) {
        self.buckets_recovered.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self, n: u64) {
        self.samples_rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_mixed_kind(&self) {
        self.mixed_kind_buckets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples_ingested: self.samples_ingested.load(Ordering::Relaxed),
            late_dropped: self.late_dropped.load(Ordering::Relaxed),
            buckets_committed: self.buckets_committed.load(Ordering::Relaxed),
            commit_retries: self.commit_retries.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            buckets_recovered: self.buckets_recovered.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            mixed_kind_buckets: self.mixed_kind_buckets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = EngineStats::new();
        stats.record_ingested(10);
        stats.record_late(2);
        stats.record_committed();
        stats.record_committed();
        stats.record_retry();

        let snap = stats.snapshot();
        assert_eq!(snap.samples_ingested, 10);
        assert_eq!(snap.late_dropped, 2);
        assert_eq!(snap.buckets_committed, 2);
        assert_eq!(snap.commit_retries, 1);
        assert_eq!(snap.commit_failures, 0);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let stats = EngineStats::new();
        stats.record_ingested(3);
        assert_eq!(stats.snapshot(), stats.snapshot());
        assert_eq!(stats.snapshot().samples_ingested, 3);
    }
}
