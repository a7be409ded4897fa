use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::StorageConfig;
use crate::rollup::{Aggregate, AggregateStore, Stat};
use crate::sample::{MetricKind, Timestamp};

use super::StoreError;

const COLUMNS: &str =
    "metric, frequency, bucket_start, kind, n, sum, avg, min, max, last, p50, p90, p99";

/// Durable, queryable store of committed aggregates.
///
/// Rows are immutable once written. Re-committing an identical row is a
/// no-op; a row with the same key but different statistics is rejected.
pub struct LongTermStore {
    db: SqlitePool,
}

impl LongTermStore {
    pub async fn open(cfg: &StorageConfig) -> Result<Self, StoreError> {
        let db = super::connect(&cfg.path, cfg).await?;
        Ok(Self { db })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Writes one aggregate. Idempotent for identical payloads.
    pub async fn commit(&self, agg: &Aggregate) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO aggregates
                (metric, frequency, bucket_start, kind, n, sum, avg, min, max, last, p50, p90, p99)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (metric, frequency, bucket_start) DO NOTHING",
        )
        .bind(agg.metric.as_str())
        .bind(agg.frequency.as_str())
        .bind(agg.bucket_start.as_millis())
        .bind(agg.kind.as_str())
        .bind(i64::try_from(agg.n).unwrap_or(i64::MAX))
        .bind(agg.sum)
        .bind(agg.avg)
        .bind(agg.min)
        .bind(agg.max)
        .bind(agg.last)
        .bind(agg.p50)
        .bind(agg.p90)
        .bind(agg.p99)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(&agg.metric, &agg.frequency, agg.bucket_start).await? {
            Some(existing) if existing != *agg => Err(StoreError::Conflict {
                metric: agg.metric.clone(),
                frequency: agg.frequency.clone(),
                bucket_start: agg.bucket_start,
            }),
            // Equal payload, or the row was removed by retention in between.
            _ => Ok(()),
        }
    }

    /// Fetches one aggregate by key.
    pub async fn get(
        &self,
        metric: &str,
        frequency: &str,
        bucket_start: Timestamp,
    ) -> Result<Option<Aggregate>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM aggregates
             WHERE metric = ? AND frequency = ? AND bucket_start = ?"
        ))
        .bind(metric)
        .bind(frequency)
        .bind(bucket_start.as_millis())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(extract_aggregate).transpose()
    }

    pub async fn contains(
        &self,
        metric: &str,
        frequency: &str,
        bucket_start: Timestamp,
    ) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM aggregates WHERE metric = ? AND frequency = ? AND bucket_start = ?",
        )
        .bind(metric)
        .bind(frequency)
        .bind(bucket_start.as_millis())
        .fetch_optional(&self.db)
        .await?;

        Ok(found.is_some())
    }

    /// Streams aggregates with `start <= bucket_start <= end`, ascending.
    pub fn query<'a>(
        &'a self,
        metric: &'a str,
        frequency: &'a str,
        start: Timestamp,
        end: Timestamp,
    ) -> BoxStream<'a, Result<Aggregate, StoreError>> {
        sqlx::query(
            "SELECT metric, frequency, bucket_start, kind, n, sum, avg, min, max, last, p50, p90, p99
             FROM aggregates
             WHERE metric = ? AND frequency = ? AND bucket_start BETWEEN ? AND ?
             ORDER BY bucket_start",
        )
        .bind(metric)
        .bind(frequency)
        .bind(start.as_millis())
        .bind(end.as_millis())
        .fetch(&self.db)
        .map(|row| extract_aggregate(&row?))
        .boxed()
    }

    /// Single-statistic series over an inclusive range, ascending.
    pub async fn query_stat(
        &self,
        metric: &str,
        frequency: &str,
        stat: Stat,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<(Timestamp, f64)>, StoreError> {
        // Column names come from a closed set, never from user input.
        let column = match stat {
            Stat::N => "CAST(n AS REAL)",
            other => other.as_str(),
        };

        let rows: Vec<(i64, f64)> = sqlx::query_as(&format!(
            "SELECT bucket_start, {column} FROM aggregates
             WHERE metric = ? AND frequency = ? AND bucket_start BETWEEN ? AND ?
             ORDER BY bucket_start"
        ))
        .bind(metric)
        .bind(frequency)
        .bind(start.as_millis())
        .bind(end.as_millis())
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ts, value)| (Timestamp::from_millis(ts), value))
            .collect())
    }

    /// Distinct metric names across all frequencies, sorted.
    pub async fn list_metrics(&self) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar("SELECT DISTINCT metric FROM aggregates ORDER BY metric")
            .fetch_all(&self.db)
            .await?;
        Ok(names)
    }

    /// Deletes aggregates of `frequency` with `bucket_start < cutoff`,
    /// `batch` rows per statement.
    pub async fn delete_before(
        &self,
        frequency: &str,
        cutoff: Timestamp,
        batch: usize,
    ) -> Result<u64, StoreError> {
        let limit = i64::try_from(batch.max(1)).unwrap_or(i64::MAX);
        let mut deleted = 0;

        loop {
            let result = sqlx::query(
                "DELETE FROM aggregates WHERE (metric, frequency, bucket_start) IN (
                    SELECT metric, frequency, bucket_start FROM aggregates
                    WHERE frequency = ? AND bucket_start < ?
                    LIMIT ?
                 )",
            )
            .bind(frequency)
            .bind(cutoff.as_millis())
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
}

impl AggregateStore for LongTermStore {
    async fn commit(&self, agg: &Aggregate) -> Result<(), StoreError> {
        LongTermStore::commit(self, agg).await
    }

    async fn contains(
        &self,
        metric: &str,
        frequency: &str,
        bucket_start: Timestamp,
    ) -> Result<bool, StoreError> {
        LongTermStore::contains(self, metric, frequency, bucket_start).await
    }
}

fn extract_aggregate(row: &SqliteRow) -> Result<Aggregate, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = kind
        .parse::<MetricKind>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let n: i64 = row.try_get("n")?;

    Ok(Aggregate {
        metric: row.try_get("metric")?,
        frequency: row.try_get("frequency")?,
        bucket_start: Timestamp::from_millis(row.try_get("bucket_start")?),
        kind,
        n: u64::try_from(n).map_err(|_| StoreError::Corrupt(format!("negative count {n}")))?,
        sum: row.try_get("sum")?,
        avg: row.try_get("avg")?,
        min: row.try_get("min")?,
        max: row.try_get("max")?,
        last: row.try_get("last")?,
        p50: row.try_get("p50")?,
        p90: row.try_get("p90")?,
        p99: row.try_get("p99")?,
    })
}
