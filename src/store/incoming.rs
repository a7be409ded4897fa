use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHasher;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::clock::Clock;
use crate::config::{Partition, StorageConfig};
use crate::sample::{MetricKind, Sample, Timestamp};

use super::StoreError;

/// Stable shard space for static partitioning of metric names.
pub const SHARD_SPACE: u64 = 1 << 16;

/// Rows per INSERT statement. Five bound parameters per row keeps each
/// statement well under SQLite's variable limit.
const APPEND_CHUNK: usize = 1000;

/// Handles per UPDATE in `ack`.
const ACK_CHUNK: usize = 900;

/// Identifies one stored sample for acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(i64);

impl Handle {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub accepted: usize,
}

/// A sample read back for crash recovery.
#[derive(Debug, Clone)]
pub struct Replayed {
    pub handle: Handle,
    pub sample: Sample,
    /// Whether the sample was acknowledged before the restart.
    pub consumed: bool,
}

/// Durable buffer of raw samples.
///
/// Any number of writers may `append` concurrently. Aggregators `drain` with a
/// lease: drained rows stay reserved for the lease duration and become
/// deliverable again if they are not acknowledged in time. Acknowledged rows
/// are kept as a replay log until retention purges them.
pub struct IncomingStore {
    db: SqlitePool,
    lease: Duration,
    clock: Arc<dyn Clock>,
}

impl IncomingStore {
    /// Opens (and creates if missing) the incoming database.
    pub async fn open(
        cfg: &StorageConfig,
        lease: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let db = super::connect(&cfg.incoming_path(), cfg).await?;
        Ok(Self { db, lease, clock })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Appends a batch atomically: either every sample is stored or none is.
    /// A batch holding any NaN or infinite value is refused whole.
    pub async fn append(&self, batch: &[Sample]) -> Result<Ack, StoreError> {
        if batch.is_empty() {
            return Ok(Ack { accepted: 0 });
        }
        if let Some(bad) = batch.iter().find(|s| !s.is_finite()) {
            return Err(StoreError::NonFinite {
                metric: bad.metric().to_string(),
                value: bad.value(),
            });
        }

        let mut tx = self.db.begin().await?;

        for chunk in batch.chunks(APPEND_CHUNK) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("INSERT INTO incoming (metric, kind, value, timestamp, shard) ");
            builder.push_values(chunk, |mut b, sample| {
                b.push_bind(sample.metric())
                    .push_bind(sample.kind().as_str())
                    .push_bind(sample.value())
                    .push_bind(sample.timestamp().as_millis())
                    .push_bind(shard_of(sample.metric()));
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(Ack {
            accepted: batch.len(),
        })
    }

    /// Leases up to `max` deliverable samples of `partition`, oldest first.
    pub async fn drain(
        &self,
        partition: Partition,
        max: usize,
    ) -> Result<Vec<(Handle, Sample)>, StoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let until = now.saturating_add(self.lease);

        let rows = sqlx::query(
            "UPDATE incoming SET lease_until = ?
             WHERE id IN (
                SELECT id FROM incoming
                WHERE consumed = 0
                  AND (lease_until IS NULL OR lease_until <= ?)
                  AND shard % ? = ?
                ORDER BY id
                LIMIT ?
             )
             RETURNING id, metric, kind, value, timestamp",
        )
        .bind(until.as_millis())
        .bind(now.as_millis())
        .bind(i64::from(partition.count))
        .bind(i64::from(partition.index))
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;

        let mut drained = rows
            .iter()
            .map(|row| Ok((Handle(row.try_get("id")?), extract_sample(row)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        // RETURNING does not guarantee order.
        drained.sort_unstable_by_key(|(handle, _)| *handle);

        Ok(drained)
    }

    /// Marks samples as consumed. Unknown or already consumed handles are
    /// ignored, so acknowledging twice is harmless.
    pub async fn ack(&self, handles: &[Handle]) -> Result<u64, StoreError> {
        if handles.is_empty() {
            return Ok(0);
        }

        let mut tx = self.db.begin().await?;
        let mut updated = 0;

        for chunk in handles.chunks(ACK_CHUNK) {
            let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
                "UPDATE incoming SET consumed = 1, lease_until = NULL WHERE consumed = 0 AND id IN (",
            );
            let mut separated = builder.separated(", ");
            for handle in chunk {
                separated.push_bind(handle.0);
            }
            separated.push_unseparated(")");
            updated += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        Ok(updated)
    }

    /// Clears every lease in `partition`, making unacknowledged samples
    /// deliverable immediately. Used when the partition's owner restarts.
    pub async fn release_leases(&self, partition: Partition) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE incoming SET lease_until = NULL
             WHERE consumed = 0 AND lease_until IS NOT NULL AND shard % ? = ?",
        )
        .bind(i64::from(partition.count))
        .bind(i64::from(partition.index))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Streams every stored sample of `partition` in append order, consumed
    /// or not.
    pub fn replay(&self, partition: Partition) -> BoxStream<'_, Result<Replayed, StoreError>> {
        sqlx::query(
            "SELECT id, metric, kind, value, timestamp, consumed FROM incoming
             WHERE shard % ? = ?
             ORDER BY id",
        )
        .bind(i64::from(partition.count))
        .bind(i64::from(partition.index))
        .fetch(&self.db)
        .map(|row| {
            let row = row?;
            Ok(Replayed {
                handle: Handle(row.try_get("id")?),
                sample: extract_sample(&row)?,
                consumed: row.try_get::<i64, _>("consumed")? != 0,
            })
        })
        .boxed()
    }

    /// Deletes consumed samples of `partition` timestamped before `horizon`,
    /// `batch` rows per statement. Returns the number of rows deleted.
    pub async fn purge_consumed_before(
        &self,
        partition: Partition,
        horizon: Timestamp,
        batch: usize,
    ) -> Result<u64, StoreError> {
        let limit = i64::try_from(batch.max(1)).unwrap_or(i64::MAX);
        let mut deleted = 0;

        loop {
            let result = sqlx::query(
                "DELETE FROM incoming WHERE id IN (
                    SELECT id FROM incoming
                    WHERE consumed = 1 AND timestamp < ? AND shard % ? = ?
                    LIMIT ?
                 )",
            )
            .bind(horizon.as_millis())
            .bind(i64::from(partition.count))
            .bind(i64::from(partition.index))
            .bind(limit)
            .execute(&self.db)
            .await?;

            deleted += result.rows_affected();
            if result.rows_affected() < limit as u64 {
                break;
            }
        }

        Ok(deleted)
    }

    /// Number of unconsumed samples in `partition`.
    pub async fn pending(&self, partition: Partition) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM incoming WHERE consumed = 0 AND shard % ? = ?",
        )
        .bind(i64::from(partition.count))
        .bind(i64::from(partition.index))
        .fetch_one(&self.db)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Stable shard for a metric name, identical across processes and builds.
pub fn shard_of(metric: &str) -> i64 {
    let mut hasher = FnvHasher::default();
    hasher.write(metric.as_bytes());
    (hasher.finish() % SHARD_SPACE) as i64
}

fn extract_sample(row: &SqliteRow) -> Result<Sample, StoreError> {
    let metric: String = row.try_get("metric")?;
    let kind: String = row.try_get("kind")?;
    let kind = kind
        .parse::<MetricKind>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let value: f64 = row.try_get("value")?;
    let timestamp: i64 = row.try_get("timestamp")?;

    Ok(Sample::new(
        metric,
        kind,
        value,
        Timestamp::from_millis(timestamp),
    ))
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testutil;

    const T0: i64 = 1_700_000_000_000;

    fn sample(metric: &str, value: f64, ts: i64) -> Sample {
        Sample::new(metric, MetricKind::Counter, value, Timestamp::from_millis(ts))
    }

    fn single() -> Partition {
        Partition::default()
    }

    async fn setup() -> (tempfile::TempDir, Arc<ManualClock>, IncomingStore) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(T0)));
        let store = testutil::incoming(&dir, clock.clone()).await;
        (dir, clock, store)
    }

    #[test]
    fn test_shard_is_stable() {
        assert_eq!(shard_of("api.requests"), shard_of("api.requests"));
        assert!(shard_of("api.requests") < SHARD_SPACE as i64);
        assert!(shard_of("") >= 0);
    }

    #[tokio::test]
    async fn test_append_then_drain_in_order() {
        let (_dir, _clock, store) = setup().await;

        let ack = store
            .append(&[sample("a", 1.0, T0), sample("b", 2.0, T0 + 1)])
            .await
            .unwrap();
        assert_eq!(ack.accepted, 2);

        let drained = store.drain(single(), 10).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].0 < drained[1].0);
        assert_eq!(drained[0].1.metric(), "a");
        assert_eq!(drained[1].1.value(), 2.0);
        assert_eq!(drained[1].1.kind(), MetricKind::Counter);
    }

    #[tokio::test]
    async fn test_empty_append_is_noop() {
        let (_dir, _clock, store) = setup().await;
        assert_eq!(store.append(&[]).await.unwrap().accepted, 0);
        assert_eq!(store.pending(single()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_finite_batch_refused_whole() {
        let (_dir, _clock, store) = setup().await;

        for bad in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let err = store
                .append(&[sample("a", 1.0, T0), sample("b", bad, T0)])
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::NonFinite { ref metric, .. } if metric == "b"));
            assert!(!err.is_transient());
        }
        assert_eq!(store.pending(single()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_large_batch_spans_chunks() {
        let (_dir, _clock, store) = setup().await;
        let batch: Vec<Sample> = (0..2_500).map(|i| sample("m", 1.0, T0 + i)).collect();

        store.append(&batch).await.unwrap();
        assert_eq!(store.pending(single()).await.unwrap(), 2_500);
    }

    #[tokio::test]
    async fn test_drain_respects_max_and_leases() {
        let (_dir, _clock, store) = setup().await;
        let batch: Vec<Sample> = (0..5).map(|i| sample("m", 1.0, T0 + i)).collect();
        store.append(&batch).await.unwrap();

        let first = store.drain(single(), 3).await.unwrap();
        assert_eq!(first.len(), 3);

        // Leased rows are not handed out twice.
        let second = store.drain(single(), 10).await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(store.drain(single(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_rows_redelivered_after_lease() {
        let (_dir, clock, store) = setup().await;
        store.append(&[sample("m", 1.0, T0)]).await.unwrap();

        let first = store.drain(single(), 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(store.drain(single(), 10).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(61));
        let again = store.drain(single(), 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].0, first[0].0);
    }

    #[tokio::test]
    async fn test_acked_rows_never_redelivered() {
        let (_dir, clock, store) = setup().await;
        store.append(&[sample("m", 1.0, T0)]).await.unwrap();

        let drained = store.drain(single(), 10).await.unwrap();
        let handles: Vec<Handle> = drained.iter().map(|(h, _)| *h).collect();
        assert_eq!(store.ack(&handles).await.unwrap(), 1);
        // Second ack is a no-op.
        assert_eq!(store.ack(&handles).await.unwrap(), 0);

        clock.advance(Duration::from_secs(3600));
        assert!(store.drain(single(), 10).await.unwrap().is_empty());
        assert_eq!(store.pending(single()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_leases_allows_immediate_redelivery() {
        let (_dir, _clock, store) = setup().await;
        store.append(&[sample("m", 1.0, T0)]).await.unwrap();

        assert_eq!(store.drain(single(), 10).await.unwrap().len(), 1);
        assert_eq!(store.release_leases(single()).await.unwrap(), 1);
        assert_eq!(store.drain(single(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partitions_are_disjoint() {
        let (_dir, _clock, store) = setup().await;
        let batch: Vec<Sample> = (0..64)
            .map(|i| sample(&format!("metric.{i}"), 1.0, T0))
            .collect();
        store.append(&batch).await.unwrap();

        let p0 = Partition { index: 0, count: 2 };
        let p1 = Partition { index: 1, count: 2 };
        let a = store.drain(p0, 100).await.unwrap();
        let b = store.drain(p1, 100).await.unwrap();

        assert_eq!(a.len() + b.len(), 64);
        for (_, s) in &a {
            assert_eq!(shard_of(s.metric()) % 2, 0);
        }
        for (_, s) in &b {
            assert_eq!(shard_of(s.metric()) % 2, 1);
        }
    }

    #[tokio::test]
    async fn test_replay_returns_consumed_and_pending() {
        let (_dir, _clock, store) = setup().await;
        store
            .append(&[sample("a", 1.0, T0), sample("b", 2.0, T0)])
            .await
            .unwrap();

        let drained = store.drain(single(), 1).await.unwrap();
        store.ack(&[drained[0].0]).await.unwrap();

        let replayed: Vec<Replayed> = store.replay(single()).try_collect().await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert!(replayed[0].consumed);
        assert!(!replayed[1].consumed);
        assert_eq!(replayed[1].sample.metric(), "b");
    }

    #[tokio::test]
    async fn test_purge_only_consumed_before_horizon() {
        let (_dir, _clock, store) = setup().await;
        store
            .append(&[
                sample("old", 1.0, T0),
                sample("old", 1.0, T0 + 1),
                sample("new", 1.0, T0 + 10_000),
                sample("unacked", 1.0, T0),
            ])
            .await
            .unwrap();

        let drained = store.drain(single(), 3).await.unwrap();
        let handles: Vec<Handle> = drained.iter().map(|(h, _)| *h).collect();
        store.ack(&handles).await.unwrap();

        let deleted = store
            .purge_consumed_before(single(), Timestamp::from_millis(T0 + 5_000), 1)
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let left: Vec<Replayed> = store.replay(single()).try_collect().await.unwrap();
        let names: Vec<&str> = left.iter().map(|r| r.sample.metric()).collect();
        assert_eq!(names, vec!["new", "unacked"]);
    }
}
