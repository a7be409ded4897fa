//! Streaming rollup of raw samples into per-bucket aggregates.
//!
//! Every sample folds into one accumulator per configured frequency. Buckets
//! stay open until `now - bucket_start > width + grace`; a close sweep then
//! finalizes and commits them. Each frequency keeps an acceptance horizon:
//! buckets starting below it are committed (or being committed) and refuse
//! further samples.

pub mod accumulator;
pub mod aggregate;
pub mod bucket;
pub mod sketch;
pub mod stats;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::backoff::RetryBackoff;
use crate::config::{Config, GaugePolicy, RetryConfig, SketchConfig};
use crate::export::health::HealthMetrics;
use crate::sample::{Sample, Timestamp};
use crate::store::StoreError;

pub use accumulator::Accumulator;
pub use aggregate::{Aggregate, Stat, UnknownStat};
pub use bucket::{BucketKey, Frequency};
pub use sketch::QuantileSketch;
pub use stats::{EngineStats, StatsSnapshot};

/// Destination for finalized aggregates.
pub trait AggregateStore: Send + Sync {
    /// Durably writes one aggregate. Identical re-commits succeed.
    fn commit(&self, agg: &Aggregate) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Whether an aggregate for the key is already stored.
    fn contains(
        &self,
        metric: &str,
        frequency: &str,
        bucket_start: Timestamp,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Failures that stop a close sweep or recovery.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// A stored aggregate differs from the one computed for the same bucket.
    /// Never resolved automatically.
    #[error("refusing to overwrite committed bucket: {0}")]
    Conflict(#[source] StoreError),

    /// The store rejected a commit with an error retrying will not fix on
    /// its own. The aggregate stays parked.
    #[error("committing aggregate: {0}")]
    Storage(#[source] StoreError),

    /// Recovery could not determine whether a bucket was committed.
    #[error("checking committed buckets during recovery: {0}")]
    Lookup(#[source] StoreError),
}

impl CommitError {
    /// Whether the aggregator must stop rather than try again next sweep.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Outcome of folding one sample into one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    Folded,
    /// The bucket is already committed; the sample was dropped.
    Late,
}

/// Bucket-level outcome of a `consume` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub folded: usize,
    pub late: usize,
    /// Samples refused because their value is NaN or infinite.
    pub rejected: usize,
}

/// Outcome of a close sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub committed: usize,
    /// Commits that failed during this sweep and were rescheduled.
    pub retried: usize,
    /// Aggregates still waiting for a successful commit.
    pub pending: usize,
}

/// Outcome of replaying stored samples after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub folded: usize,
    /// Bucket folds skipped because the bucket was already committed.
    pub skipped: usize,
    /// Bucket folds skipped because the bucket is past its retention.
    pub expired: usize,
}

/// Memo of committed-bucket lookups, kept across replay chunks.
#[derive(Debug, Default)]
pub struct RecoveryState {
    committed: HashMap<BucketKey, bool>,
}

impl RecoveryState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A finalized aggregate waiting for a successful commit.
#[derive(Debug)]
struct PendingCommit {
    aggregate: Aggregate,
    backoff: RetryBackoff,
    next_attempt: Timestamp,
    reported: bool,
}

/// Per-bucket accumulators for every configured frequency.
///
/// `consume` may be called from many threads at once: accumulators live in a
/// sharded map, so samples for different buckets fold in parallel while
/// samples for the same bucket serialize on its entry.
pub struct RollupEngine {
    frequencies: Vec<Frequency>,
    grace: Duration,
    gauge_policy: GaugePolicy,
    sketch: SketchConfig,
    commit_retry: RetryConfig,

    /// Lowest bucket start still accepting samples, per frequency.
    horizons: Vec<AtomicI64>,
    buckets: DashMap<BucketKey, Accumulator>,
    pending: parking_lot::Mutex<Vec<PendingCommit>>,
    /// Oldest bucket start of the aggregates a sweep is committing.
    committing_floor: AtomicI64,

    stats: EngineStats,
    health: Option<Arc<HealthMetrics>>,
}

impl RollupEngine {
    /// Creates an engine whose buckets already closed at `now` refuse samples.
    pub fn new(cfg: &Config, now: Timestamp) -> Self {
        let frequencies: Vec<Frequency> = cfg.frequencies.iter().map(Frequency::from_config).collect();
        let horizons = frequencies
            .iter()
            .map(|f| AtomicI64::new(f.close_horizon(now, cfg.grace_period).as_millis()))
            .collect();

        Self {
            frequencies,
            grace: cfg.grace_period,
            gauge_policy: cfg.gauge_policy,
            sketch: cfg.sketch,
            commit_retry: cfg.aggregator.commit_retry,
            horizons,
            buckets: DashMap::with_capacity(1024),
            pending: parking_lot::Mutex::new(Vec::new()),
            committing_floor: AtomicI64::new(i64::MAX),
            stats: EngineStats::new(),
            health: None,
        }
    }

    /// Attaches Prometheus metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn frequencies(&self) -> &[Frequency] {
        &self.frequencies
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Accumulators currently held in memory.
    pub fn open_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Closed buckets waiting for a successful commit.
    pub fn pending_commits(&self) -> usize {
        self.pending.lock().len()
    }

    /// Folds a batch into every frequency. Samples for committed buckets are
    /// dropped per bucket and counted; non-finite samples are refused.
    pub fn consume(&self, batch: &[Sample]) -> ConsumeReport {
        let mut report = ConsumeReport::default();

        for sample in batch {
            if !sample.is_finite() {
                report.rejected += 1;
                continue;
            }
            for idx in 0..self.frequencies.len() {
                match self.fold(idx, sample, true) {
                    Fold::Folded => report.folded += 1,
                    Fold::Late => report.late += 1,
                }
            }
        }

        self.stats.record_ingested(batch.len() as u64);
        if report.rejected > 0 {
            self.stats.record_rejected(report.rejected as u64);
            tracing::warn!(rejected = report.rejected, "refused non-finite samples");
        }
        if report.late > 0 {
            self.stats.record_late(report.late as u64);
            tracing::debug!(late = report.late, "dropped samples for committed buckets");
        }

        if let Some(health) = &self.health {
            health.samples_ingested.inc_by(batch.len() as f64);
            health.samples_late_dropped.inc_by(report.late as f64);
            health.buckets_open.set(self.buckets.len() as f64);
        }

        report
    }

    fn fold(&self, idx: usize, sample: &Sample, check_horizon: bool) -> Fold {
        let start = self.frequencies[idx].bucket_start(sample.timestamp());
        let key = BucketKey::new(Arc::clone(sample.metric_arc()), idx, start);

        // The entry lock is held across the horizon check so a concurrent
        // sweep either sees this fold or this fold sees the new horizon.
        let entry = self.buckets.entry(key);
        if check_horizon && start.as_millis() < self.horizons[idx].load(Ordering::SeqCst) {
            return Fold::Late;
        }

        entry
            .or_insert_with(|| Accumulator::new(&self.sketch))
            .fold(sample);

        Fold::Folded
    }

    /// Closes every bucket due at `now` and commits it, then retries earlier
    /// failed commits whose backoff has elapsed.
    ///
    /// Failures never drop an aggregate: it is parked and retried on later
    /// sweeps. Transient errors are absorbed with backoff. A conflicting
    /// payload or a non-transient storage error aborts the sweep and is
    /// returned; the aggregates not yet committed stay parked.
    pub async fn close_due<S: AggregateStore>(
        &self,
        now: Timestamp,
        store: &S,
    ) -> Result<CloseReport, CommitError> {
        let started = Instant::now();

        for (idx, frequency) in self.frequencies.iter().enumerate() {
            let horizon = frequency.close_horizon(now, self.grace).as_millis();
            self.horizons[idx].fetch_max(horizon, Ordering::SeqCst);
        }

        let due: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.start.as_millis() < self.horizons[key.frequency].load(Ordering::SeqCst)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut ready = {
            let mut pending = self.pending.lock();
            let (ready, later): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|p| p.next_attempt <= now);
            *pending = later;
            ready
        };

        for key in due {
            if let Some((key, acc)) = self.buckets.remove(&key) {
                let frequency = &self.frequencies[key.frequency];
                if acc.is_mixed() {
                    self.stats.record_mixed_kind();
                    tracing::warn!(
                        metric = %key.metric,
                        frequency = frequency.name(),
                        bucket_start = %key.start,
                        kind = %acc.kind(),
                        "bucket folded samples of several kinds"
                    );
                }
                ready.push(PendingCommit {
                    aggregate: acc.finish(&key, frequency, self.gauge_policy),
                    backoff: RetryBackoff::new(&self.commit_retry),
                    next_attempt: now,
                    reported: false,
                });
            }
        }

        ready.sort_by(|a, b| {
            a.aggregate
                .bucket_start
                .cmp(&b.aggregate.bucket_start)
                .then_with(|| a.aggregate.metric.cmp(&b.aggregate.metric))
        });

        let floor = ready
            .iter()
            .map(|p| p.aggregate.bucket_start.as_millis())
            .min()
            .unwrap_or(i64::MAX);
        self.committing_floor.store(floor, Ordering::SeqCst);

        let result = self.commit_all(ready, now, store).await;

        self.committing_floor.store(i64::MAX, Ordering::SeqCst);

        let pending = self.pending.lock().len();
        if let Some(health) = &self.health {
            health.buckets_open.set(self.buckets.len() as f64);
            health.buckets_overdue.set(pending as f64);
            health
                .sweep_duration
                .with_label_values(&["close"])
                .observe(started.elapsed().as_secs_f64());
        }

        let (committed, retried) = result?;
        if committed > 0 || retried > 0 {
            tracing::debug!(committed, retried, pending, "close sweep finished");
        }

        Ok(CloseReport {
            committed,
            retried,
            pending,
        })
    }

    async fn commit_all<S: AggregateStore>(
        &self,
        ready: Vec<PendingCommit>,
        now: Timestamp,
        store: &S,
    ) -> Result<(usize, usize), CommitError> {
        let mut committed = 0;
        let mut retry = Vec::new();
        let mut iter = ready.into_iter();

        while let Some(mut item) = iter.next() {
            match store.commit(&item.aggregate).await {
                Ok(()) => {
                    committed += 1;
                    self.stats.record_committed();
                    if let Some(health) = &self.health {
                        health
                            .buckets_committed
                            .with_label_values(&[item.aggregate.frequency.as_str()])
                            .inc();
                    }
                    if item.backoff.started() {
                        tracing::info!(
                            metric = %item.aggregate.metric,
                            frequency = %item.aggregate.frequency,
                            bucket_start = %item.aggregate.bucket_start,
                            attempts = item.backoff.attempt() + 1,
                            "committed aggregate after retries"
                        );
                    }
                }
                Err(e @ StoreError::Conflict { .. }) => {
                    tracing::error!(
                        metric = %item.aggregate.metric,
                        frequency = %item.aggregate.frequency,
                        bucket_start = %item.aggregate.bucket_start,
                        "committed aggregate differs from recomputed bucket"
                    );
                    let mut pending = self.pending.lock();
                    pending.push(item);
                    pending.extend(iter);
                    pending.append(&mut retry);
                    return Err(CommitError::Conflict(e));
                }
                Err(e) if !e.is_transient() => {
                    let delay = item.backoff.next_backoff();
                    item.next_attempt = now.saturating_add(delay);
                    item.reported = true;
                    self.stats.record_failure();
                    if let Some(health) = &self.health {
                        health.commit_failures.inc();
                    }
                    tracing::error!(
                        metric = %item.aggregate.metric,
                        frequency = %item.aggregate.frequency,
                        bucket_start = %item.aggregate.bucket_start,
                        error = %e,
                        "aggregate commit failed with a non-transient storage error"
                    );
                    let mut pending = self.pending.lock();
                    pending.push(item);
                    pending.extend(iter);
                    pending.append(&mut retry);
                    return Err(CommitError::Storage(e));
                }
                Err(e) => {
                    let delay = item.backoff.next_backoff();
                    item.next_attempt = now.saturating_add(delay);
                    self.stats.record_retry();
                    if let Some(health) = &self.health {
                        health.commit_retries.inc();
                    }

                    if item.backoff.exhausted() && !item.reported {
                        item.reported = true;
                        self.stats.record_failure();
                        if let Some(health) = &self.health {
                            health.commit_failures.inc();
                        }
                        tracing::error!(
                            metric = %item.aggregate.metric,
                            frequency = %item.aggregate.frequency,
                            bucket_start = %item.aggregate.bucket_start,
                            attempts = item.backoff.attempt(),
                            error = %e,
                            "commit retry budget exhausted, still retrying"
                        );
                    } else {
                        tracing::warn!(
                            metric = %item.aggregate.metric,
                            frequency = %item.aggregate.frequency,
                            attempt = item.backoff.attempt(),
                            retry_in = ?delay,
                            error = %e,
                            "aggregate commit failed"
                        );
                    }

                    retry.push(item);
                }
            }
        }

        let retried = retry.len();
        self.pending.lock().append(&mut retry);

        Ok((committed, retried))
    }

    /// Rebuilds buckets from replayed samples after a restart.
    ///
    /// Samples for buckets still open fold normally. Samples for buckets that
    /// closed while the process was down fold only if the bucket is missing
    /// from `store`; the next sweep commits them. Buckets older than their
    /// frequency's retention at `now` are never rebuilt: a missing row there
    /// was expired, not lost.
    pub async fn recover<S: AggregateStore>(
        &self,
        samples: &[Sample],
        now: Timestamp,
        store: &S,
        state: &mut RecoveryState,
    ) -> Result<RecoveryReport, CommitError> {
        let mut report = RecoveryReport::default();
        let cutoffs: Vec<Option<Timestamp>> = self
            .frequencies
            .iter()
            .map(|f| f.retention().map(|r| now.saturating_sub(r)))
            .collect();

        for sample in samples {
            if !sample.is_finite() {
                continue;
            }
            for (idx, frequency) in self.frequencies.iter().enumerate() {
                let start = frequency.bucket_start(sample.timestamp());
                if cutoffs[idx].is_some_and(|cutoff| start < cutoff) {
                    report.expired += 1;
                    continue;
                }
                if start.as_millis() >= self.horizons[idx].load(Ordering::SeqCst) {
                    self.fold(idx, sample, false);
                    report.folded += 1;
                    continue;
                }

                let key = BucketKey::new(Arc::clone(sample.metric_arc()), idx, start);
                let committed = match state.committed.get(&key) {
                    Some(committed) => *committed,
                    None => {
                        let committed = store
                            .contains(sample.metric(), frequency.name(), start)
                            .await
                            .map_err(CommitError::Lookup)?;
                        if !committed {
                            self.stats.record_recovered(1);
                        }
                        state.committed.insert(key, committed);
                        committed
                    }
                };

                if committed {
                    report.skipped += 1;
                } else {
                    self.fold(idx, sample, false);
                    report.folded += 1;
                }
            }
        }

        if let Some(health) = &self.health {
            health.buckets_open.set(self.buckets.len() as f64);
        }

        Ok(report)
    }

    /// Oldest timestamp any uncommitted bucket may still need. Raw samples
    /// strictly older than this are folded into committed aggregates at
    /// every frequency.
    pub fn purge_horizon(&self) -> Timestamp {
        let horizons = self.horizons.iter().map(|h| h.load(Ordering::SeqCst));
        let open = self.buckets.iter().map(|entry| entry.key().start.as_millis());
        let pending = self
            .pending
            .lock()
            .iter()
            .map(|p| p.aggregate.bucket_start.as_millis())
            .min()
            .unwrap_or(i64::MAX);

        let floor = horizons
            .chain(open)
            .chain([pending, self.committing_floor.load(Ordering::SeqCst)])
            .min()
            .unwrap_or(i64::MAX);

        Timestamp::from_millis(floor)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::config::FrequencyConfig;
    use crate::sample::MetricKind;

    // Midnight UTC, aligned to every test width.
    const T0: i64 = 1_699_920_000_000;

    /// In-memory store with the same commit contract as the long-term store.
    #[derive(Default)]
    struct MemoryStore {
        rows: parking_lot::Mutex<HashMap<(String, String, i64), Aggregate>>,
        fail_remaining: AtomicU32,
        fail_hard_remaining: AtomicU32,
        commits: AtomicU32,
    }

    impl MemoryStore {
        fn failing(times: u32) -> Self {
            let store = Self::default();
            store.fail_remaining.store(times, Ordering::SeqCst);
            store
        }

        fn get(&self, metric: &str, frequency: &str, start: i64) -> Option<Aggregate> {
            self.rows
                .lock()
                .get(&(metric.to_string(), frequency.to_string(), start))
                .cloned()
        }

        fn len(&self) -> usize {
            self.rows.lock().len()
        }
    }

    impl AggregateStore for MemoryStore {
        async fn commit(&self, agg: &Aggregate) -> Result<(), StoreError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut));
            }
            let failing_hard = self
                .fail_hard_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing_hard {
                return Err(StoreError::Database(sqlx::Error::RowNotFound));
            }

            let key = (agg.metric.clone(), agg.frequency.clone(), agg.bucket_start.as_millis());
            let mut rows = self.rows.lock();
            match rows.get(&key) {
                Some(existing) if existing != agg => Err(StoreError::Conflict {
                    metric: agg.metric.clone(),
                    frequency: agg.frequency.clone(),
                    bucket_start: agg.bucket_start,
                }),
                Some(_) => Ok(()),
                None => {
                    rows.insert(key, agg.clone());
                    Ok(())
                }
            }
        }

        async fn contains(
            &self,
            metric: &str,
            frequency: &str,
            bucket_start: Timestamp,
        ) -> Result<bool, StoreError> {
            Ok(self.get(metric, frequency, bucket_start.as_millis()).is_some())
        }
    }

    fn config(widths: &[u64]) -> Config {
        let mut cfg = Config::default();
        cfg.frequencies = widths
            .iter()
            .map(|w| FrequencyConfig {
                name: format!("s{w}"),
                bucket_width: Duration::from_secs(*w),
                retention: None,
            })
            .collect();
        cfg.grace_period = Duration::from_secs(2);
        cfg.aggregator.commit_retry = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_attempts: 3,
        };
        cfg
    }

    fn at(ms: i64) -> Timestamp {
        Timestamp::from_millis(T0 + ms)
    }

    fn counter(metric: &str, value: f64, ms: i64) -> Sample {
        Sample::new(metric, MetricKind::Counter, value, at(ms))
    }

    fn new_engine(widths: &[u64]) -> RollupEngine {
        RollupEngine::new(&config(widths), at(0))
    }

    #[test]
    fn test_consume_folds_every_frequency() {
        let engine = new_engine(&[10, 60]);
        let report = engine.consume(&[counter("a", 1.0, 0), counter("b", 1.0, 1_000)]);

        assert_eq!(report, ConsumeReport { folded: 4, late: 0, rejected: 0 });
        assert_eq!(engine.open_buckets(), 4);
        assert_eq!(engine.stats().samples_ingested, 2);
    }

    #[tokio::test]
    async fn test_bucket_closes_strictly_after_width_plus_grace() {
        let engine = new_engine(&[10]);
        let store = MemoryStore::default();
        engine.consume(&[counter("a", 2.0, 500), counter("a", 4.0, 9_999)]);

        // now - start == width + grace: still open.
        let report = engine.close_due(at(12_000), &store).await.unwrap();
        assert_eq!(report.committed, 0);
        assert_eq!(engine.open_buckets(), 1);

        let report = engine.close_due(at(12_001), &store).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(engine.open_buckets(), 0);

        let agg = store.get("a", "s10", T0).unwrap();
        assert_eq!(agg.n, 2);
        assert_eq!(agg.sum, 6.0);
        assert_eq!(agg.avg, 3.0);
        assert_eq!(agg.last, 4.0);
    }

    #[tokio::test]
    async fn test_late_sample_dropped_and_counted() {
        let engine = new_engine(&[10, 60]);
        let store = MemoryStore::default();
        engine.consume(&[counter("a", 1.0, 1_000)]);
        engine.close_due(at(12_001), &store).await.unwrap();

        let report = engine.consume(&[counter("a", 100.0, 2_000)]);
        // Late for the 10s bucket, still open at 60s.
        assert_eq!(report, ConsumeReport { folded: 1, late: 1, rejected: 0 });
        assert_eq!(engine.stats().late_dropped, 1);
        assert_eq!(store.get("a", "s10", T0).unwrap().sum, 1.0);

        engine.close_due(at(62_001), &store).await.unwrap();
        assert_eq!(store.get("a", "s60", T0).unwrap().sum, 101.0);
    }

    #[test]
    fn test_samples_closed_before_start_are_late() {
        let engine = RollupEngine::new(&config(&[10]), at(60_000));
        let report = engine.consume(&[counter("a", 1.0, 0)]);
        assert_eq!(report.late, 1);
        assert_eq!(engine.open_buckets(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_consume_no_double_count() {
        let engine = new_engine(&[10]);
        let store = MemoryStore::default();

        std::thread::scope(|s| {
            for t in 0..8 {
                let engine = &engine;
                s.spawn(move || {
                    let own = format!("metric.{t}");
                    for i in 0..500 {
                        engine.consume(&[counter(&own, 1.0, i), counter("shared", 2.0, i)]);
                    }
                });
            }
        });

        engine.close_due(at(20_000), &store).await.unwrap();

        for t in 0..8 {
            let agg = store.get(&format!("metric.{t}"), "s10", T0).unwrap();
            assert_eq!(agg.n, 500);
            assert_eq!(agg.sum, 500.0);
        }
        let shared = store.get("shared", "s10", T0).unwrap();
        assert_eq!(shared.n, 4_000);
        assert_eq!(shared.sum, 8_000.0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_with_backoff() {
        let engine = new_engine(&[10]);
        let store = MemoryStore::failing(2);
        engine.consume(&[counter("a", 1.0, 0)]);

        let report = engine.close_due(at(12_001), &store).await.unwrap();
        assert_eq!(report, CloseReport { committed: 0, retried: 1, pending: 1 });

        // Backoff not elapsed.
        let report = engine.close_due(at(12_050), &store).await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(store.commits.load(Ordering::SeqCst), 1);

        engine.close_due(at(12_101), &store).await.unwrap();
        let report = engine.close_due(at(12_301), &store).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.pending, 0);

        let stats = engine.stats();
        assert_eq!(stats.commit_retries, 2);
        assert_eq!(stats.buckets_committed, 1);
        assert_eq!(stats.commit_failures, 0);
        assert_eq!(store.get("a", "s10", T0).unwrap().n, 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_reported_once_and_kept() {
        let engine = new_engine(&[10]);
        let store = MemoryStore::failing(5);
        engine.consume(&[counter("a", 1.0, 0)]);

        let mut now = 12_001;
        for _ in 0..5 {
            engine.close_due(at(now), &store).await.unwrap();
            now += 1_000;
        }
        assert_eq!(engine.pending_commits(), 1);
        assert_eq!(engine.stats().commit_failures, 1);

        let report = engine.close_due(at(now), &store).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(engine.pending_commits(), 0);
    }

    #[tokio::test]
    async fn test_identical_recommit_is_success() {
        let store = MemoryStore::default();
        for _ in 0..2 {
            // Two engines closing the same data race to the same row.
            let engine = new_engine(&[10]);
            engine.consume(&[counter("a", 1.0, 0)]);
            let report = engine.close_due(at(12_001), &store).await.unwrap();
            assert_eq!(report.committed, 1);
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_payload_is_fatal() {
        let engine = new_engine(&[10]);
        let store = MemoryStore::default();
        engine.consume(&[counter("a", 1.0, 0)]);
        engine.close_due(at(12_001), &store).await.unwrap();

        let other = new_engine(&[10]);
        other.consume(&[counter("a", 5.0, 0), counter("b", 1.0, 0)]);
        let err = other.close_due(at(12_001), &store).await.unwrap_err();

        assert!(matches!(err, CommitError::Conflict(StoreError::Conflict { .. })));
        assert_eq!(store.get("a", "s10", T0).unwrap().sum, 1.0);
        // Nothing is discarded.
        assert_eq!(other.pending_commits(), 2);
    }

    #[tokio::test]
    async fn test_recover_skips_committed_buckets() {
        let engine = new_engine(&[10]);
        let store = MemoryStore::default();
        engine.consume(&[counter("a", 1.0, 0)]);
        engine.close_due(at(12_001), &store).await.unwrap();

        // Restart well after both buckets closed.
        let restarted = RollupEngine::new(&config(&[10]), at(30_000));
        let replay = vec![
            counter("a", 1.0, 0),
            counter("a", 3.0, 10_000),
            counter("a", 4.0, 10_500),
            counter("a", 7.0, 29_000),
        ];
        let mut state = RecoveryState::new();
        let report = restarted
            .recover(&replay, at(30_000), &store, &mut state)
            .await
            .unwrap();

        assert_eq!(report, RecoveryReport { folded: 3, skipped: 1, expired: 0 });
        assert_eq!(restarted.stats().buckets_recovered, 1);

        restarted.close_due(at(30_000), &store).await.unwrap();
        assert_eq!(store.get("a", "s10", T0).unwrap().sum, 1.0);
        assert_eq!(store.get("a", "s10", T0 + 10_000).unwrap().sum, 7.0);
        // The open bucket stays in memory.
        assert_eq!(restarted.open_buckets(), 1);
    }

    #[tokio::test]
    async fn test_purge_horizon_tracks_oldest_needed_bucket() {
        let engine = new_engine(&[10, 60]);
        let store = MemoryStore::failing(1);
        assert_eq!(engine.purge_horizon(), at(-60_000));

        engine.consume(&[counter("a", 1.0, 5_000)]);
        assert_eq!(engine.purge_horizon(), at(-60_000));

        // 10s bucket fails to commit; 60s bucket still open.
        engine.close_due(at(12_001), &store).await.unwrap();
        assert_eq!(engine.pending_commits(), 1);
        assert_eq!(engine.purge_horizon(), at(0));

        engine.close_due(at(62_001), &store).await.unwrap();
        assert_eq!(engine.pending_commits(), 0);
        assert_eq!(engine.purge_horizon(), at(60_000));
    }

    #[tokio::test]
    async fn test_recover_does_not_rebuild_expired_buckets() {
        let mut cfg = config(&[10, 3600]);
        cfg.frequencies[0].retention = Some(Duration::from_secs(60));
        // Retention already removed the 10s row for T0; the store is empty.
        let store = MemoryStore::default();

        let restarted = RollupEngine::new(&cfg, at(200_000));
        let replay = vec![counter("a", 1.0, 0), counter("a", 2.0, 150_000)];
        let mut state = RecoveryState::new();
        let report = restarted
            .recover(&replay, at(200_000), &store, &mut state)
            .await
            .unwrap();

        // 10s bucket at T0 is expired; 10s bucket at 150s and the open hour
        // bucket are rebuilt.
        assert_eq!(report, RecoveryReport { folded: 3, skipped: 0, expired: 1 });

        restarted.close_due(at(200_000), &store).await.unwrap();
        assert!(store.get("a", "s10", T0).is_none());
        assert_eq!(store.get("a", "s10", T0 + 150_000).unwrap().sum, 2.0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_non_transient_commit_error_surfaces_and_keeps_aggregates() {
        let engine = new_engine(&[10]);
        let store = MemoryStore::default();
        store.fail_hard_remaining.store(1, Ordering::SeqCst);
        engine.consume(&[counter("a", 1.0, 0), counter("b", 2.0, 0)]);

        let err = engine.close_due(at(12_001), &store).await.unwrap_err();
        assert!(matches!(err, CommitError::Storage(StoreError::Database(_))));
        assert!(!err.is_fatal());
        assert_eq!(engine.pending_commits(), 2);

        let stats = engine.stats();
        assert_eq!(stats.commit_failures, 1);
        assert_eq!(stats.commit_retries, 0);

        // Parked aggregates commit on a later sweep once the store recovers.
        let report = engine.close_due(at(13_001), &store).await.unwrap();
        assert_eq!(report.committed, 2);
        assert_eq!(report.pending, 0);
        assert_eq!(store.get("a", "s10", T0).unwrap().sum, 1.0);
        assert_eq!(store.get("b", "s10", T0).unwrap().sum, 2.0);
    }

    #[test]
    fn test_consume_refuses_non_finite_values() {
        let engine = new_engine(&[10]);
        let report = engine.consume(&[
            counter("a", 1.0, 0),
            counter("a", f64::INFINITY, 0),
            counter("a", f64::NEG_INFINITY, 0),
            counter("a", f64::NAN, 0),
        ]);

        assert_eq!(report, ConsumeReport { folded: 1, late: 0, rejected: 3 });
        assert_eq!(engine.stats().samples_rejected, 3);
    }

    #[tokio::test]
    async fn test_mixed_kind_bucket_is_counted() {
        let mut cfg = config(&[10]);
        cfg.gauge_policy = GaugePolicy::Last;
        let engine = RollupEngine::new(&cfg, at(0));
        let store = MemoryStore::default();

        engine.consume(&[
            Sample::new("a", MetricKind::Gauge, 5.0, at(1_000)),
            counter("a", 1.0, 2_000),
        ]);
        engine.close_due(at(12_001), &store).await.unwrap();

        let agg = store.get("a", "s10", T0).unwrap();
        assert_eq!(agg.kind, MetricKind::Counter);
        assert_eq!(agg.n, 2);
        assert_eq!(engine.stats().mixed_kind_buckets, 1);
    }

    #[test]
    fn test_concurrent_consume_and_close_never_lose_samples() {
        let engine = new_engine(&[10]);
        let store = MemoryStore::default();
        let producers = 4;
        let per_producer = 2_000i64;

        std::thread::scope(|s| {
            for t in 0..producers {
                let engine = &engine;
                s.spawn(move || {
                    let metric = format!("m{}", t % 2);
                    let samples: Vec<Sample> = (0..per_producer)
                        .map(|i| counter(&metric, 1.0, i * 25))
                        .collect();
                    for batch in samples.chunks(50) {
                        engine.consume(batch);
                    }
                });
            }

            let (engine, store) = (&engine, &store);
            s.spawn(move || {
                for step in 0..120 {
                    futures::executor::block_on(engine.close_due(at(step * 500), store)).unwrap();
                    std::thread::yield_now();
                }
            });
        });

        futures::executor::block_on(engine.close_due(at(1_000_000), &store)).unwrap();
        assert_eq!(engine.open_buckets(), 0);

        // Every sample either reached a committed aggregate or was counted
        // late; none vanished and no bucket was committed twice.
        let committed: u64 = store.rows.lock().values().map(|agg| agg.n).sum();
        let late = engine.stats().late_dropped;
        assert_eq!(committed + late, (producers * per_producer) as u64);
        for agg in store.rows.lock().values() {
            assert_eq!(agg.sum, agg.n as f64);
        }
    }
}
