use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Partition;
use crate::export::health::HealthMetrics;
use crate::rollup::Frequency;
use crate::sample::Timestamp;
use crate::store::{IncomingStore, LongTermStore, StoreError};

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub aggregates_deleted: u64,
    pub samples_deleted: u64,
    pub elapsed: Duration,
}

/// Deletes expired aggregates and raw samples that every frequency has
/// already rolled up.
///
/// Deletion is batched and idempotent. An interrupted sweep leaves rows
/// behind for the next one; it never removes rows still within retention.
pub struct RetentionManager {
    longterm: Arc<LongTermStore>,
    incoming: Option<Arc<IncomingStore>>,
    frequencies: Vec<Frequency>,
    partition: Partition,
    batch_size: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl RetentionManager {
    pub fn new(
        longterm: Arc<LongTermStore>,
        frequencies: Vec<Frequency>,
        batch_size: usize,
    ) -> Self {
        Self {
            longterm,
            incoming: None,
            frequencies,
            partition: Partition::default(),
            batch_size,
            health: None,
        }
    }

    /// Enables raw-sample purging for `partition`.
    pub fn with_incoming(mut self, incoming: Arc<IncomingStore>, partition: Partition) -> Self {
        self.incoming = Some(incoming);
        self.partition = partition;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Deletes aggregates with `bucket_start < now - retention` for each
    /// frequency with finite retention, then raw samples older than
    /// `raw_horizon` when one is given.
    pub async fn sweep(
        &self,
        now: Timestamp,
        raw_horizon: Option<Timestamp>,
    ) -> Result<SweepReport, StoreError> {
        let started = Instant::now();
        let mut report = SweepReport::default();

        for frequency in &self.frequencies {
            let Some(retention) = frequency.retention() else {
                continue;
            };

            let cutoff = now.saturating_sub(retention);
            let deleted = self
                .longterm
                .delete_before(frequency.name(), cutoff, self.batch_size)
                .await?;

            if deleted > 0 {
                tracing::debug!(
                    frequency = frequency.name(),
                    cutoff = %cutoff,
                    deleted,
                    "expired aggregates"
                );
            }
            report.aggregates_deleted += deleted;
        }

        if let (Some(incoming), Some(horizon)) = (&self.incoming, raw_horizon) {
            report.samples_deleted = incoming
                .purge_consumed_before(self.partition, horizon, self.batch_size)
                .await?;
        }

        report.elapsed = started.elapsed();

        if let Some(health) = &self.health {
            health
                .retention_deleted
                .with_label_values(&["aggregates"])
                .inc_by(report.aggregates_deleted as f64);
            health
                .retention_deleted
                .with_label_values(&["samples"])
                .inc_by(report.samples_deleted as f64);
            health
                .sweep_duration
                .with_label_values(&["retention"])
                .observe(report.elapsed.as_secs_f64());
        }

        if report.aggregates_deleted > 0 || report.samples_deleted > 0 {
            tracing::info!(
                aggregates = report.aggregates_deleted,
                samples = report.samples_deleted,
                elapsed = ?report.elapsed,
                "retention sweep completed"
            );
        }

        Ok(report)
    }
}
