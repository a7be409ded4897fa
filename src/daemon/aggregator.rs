use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryBackoff;
use crate::clock::Clock;
use crate::config::{AggregatorConfig, Config};
use crate::export::health::HealthMetrics;
use crate::retention::{RetentionManager, SweepReport};
use crate::rollup::{CloseReport, CommitError, RecoveryReport, RecoveryState, RollupEngine};
use crate::sample::Sample;
use crate::store::{Handle, IncomingStore, LongTermStore};

/// Drains one partition of the incoming store into the rollup engine and
/// commits closed buckets to the long-term store.
pub struct AggregatorDaemon {
    cfg: AggregatorConfig,
    retention_interval: Duration,
    engine: Arc<RollupEngine>,
    incoming: Arc<IncomingStore>,
    longterm: Arc<LongTermStore>,
    retention: RetentionManager,
    clock: Arc<dyn Clock>,
    health: Option<Arc<HealthMetrics>>,
    /// Folded samples whose acknowledgement has not succeeded yet. They are
    /// skipped if redelivered.
    unacked: HashSet<Handle>,
}

impl AggregatorDaemon {
    pub fn new(
        cfg: &Config,
        engine: Arc<RollupEngine>,
        incoming: Arc<IncomingStore>,
        longterm: Arc<LongTermStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retention = RetentionManager::new(
            Arc::clone(&longterm),
            engine.frequencies().to_vec(),
            cfg.retention.batch_size,
        )
        .with_incoming(Arc::clone(&incoming), cfg.aggregator.partition);

        Self {
            cfg: cfg.aggregator.clone(),
            retention_interval: cfg.retention.interval,
            engine,
            incoming,
            longterm,
            retention,
            clock,
            health: None,
            unacked: HashSet::new(),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.retention = self.retention.with_health(Arc::clone(&health));
        self.health = Some(health);
        self
    }

    pub fn engine(&self) -> &Arc<RollupEngine> {
        &self.engine
    }

    /// Rebuilds in-memory state from the incoming log after a restart.
    ///
    /// Leases held by a previous instance of this partition are released, every
    /// stored sample is replayed, and samples never acknowledged are
    /// acknowledged now that they are folded. Buckets already past retention
    /// are not rebuilt.
    pub async fn recover(&mut self) -> Result<RecoveryReport> {
        let partition = self.cfg.partition;
        let now = self.clock.now();
        let released = self
            .incoming
            .release_leases(partition)
            .await
            .context("releasing stale leases")?;

        let incoming = Arc::clone(&self.incoming);
        let mut replay = incoming.replay(partition);
        let mut state = RecoveryState::new();
        let mut report = RecoveryReport::default();
        let mut chunk: Vec<Sample> = Vec::with_capacity(self.cfg.drain_batch_size);
        let mut unconsumed: Vec<Handle> = Vec::new();
        let mut replayed = 0usize;

        while let Some(row) = replay.try_next().await.context("replaying incoming samples")? {
            replayed += 1;
            if !row.consumed {
                unconsumed.push(row.handle);
            }
            chunk.push(row.sample);

            if chunk.len() >= self.cfg.drain_batch_size {
                let part = self
                    .engine
                    .recover(&chunk, now, self.longterm.as_ref(), &mut state)
                    .await?;
                report.folded += part.folded;
                report.skipped += part.skipped;
                report.expired += part.expired;
                chunk.clear();
            }
        }
        drop(replay);

        if !chunk.is_empty() {
            let part = self
                .engine
                .recover(&chunk, now, self.longterm.as_ref(), &mut state)
                .await?;
            report.folded += part.folded;
            report.skipped += part.skipped;
            report.expired += part.expired;
        }

        self.ack(unconsumed).await;

        info!(
            partition = partition.index,
            released,
            replayed,
            folded = report.folded,
            skipped = report.skipped,
            expired = report.expired,
            open_buckets = self.engine.open_buckets(),
            "recovery completed"
        );

        Ok(report)
    }

    /// Drains one batch, folds it and acknowledges it. Returns the number of
    /// samples drained.
    pub async fn drain_once(&mut self) -> Result<usize> {
        self.retry_unacked().await;

        let drained = self
            .incoming
            .drain(self.cfg.partition, self.cfg.drain_batch_size)
            .await
            .context("draining incoming samples")?;

        if drained.is_empty() {
            return Ok(0);
        }

        let count = drained.len();
        let mut handles = Vec::with_capacity(count);
        let mut samples = Vec::with_capacity(count);
        for (handle, sample) in drained {
            // Already folded; only the acknowledgement is outstanding.
            if self.unacked.contains(&handle) {
                continue;
            }
            handles.push(handle);
            samples.push(sample);
        }

        let report = self.engine.consume(&samples);
        self.ack(handles).await;

        if let Some(health) = &self.health {
            health.drain_batch_size.observe(count as f64);
        }
        debug!(drained = count, folded = report.folded, late = report.late, "drained batch");

        Ok(count)
    }

    /// Commits every bucket closed at the current time. In-flight samples get
    /// one last chance to reach closing buckets first.
    pub async fn close_once(&mut self) -> Result<CloseReport> {
        let now = self.clock.now();

        for _ in 0..self.cfg.final_flush_batches {
            match self.drain_once().await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "final flush drain failed");
                    break;
                }
            }
        }

        let report = self
            .engine
            .close_due(now, self.longterm.as_ref())
            .await
            .context("committing closed buckets")?;

        Ok(report)
    }

    /// Applies retention to aggregates and purges raw samples every frequency
    /// has rolled up.
    pub async fn retention_once(&mut self) -> Result<SweepReport> {
        let horizon = self.engine.purge_horizon();
        let report = self
            .retention
            .sweep(self.clock.now(), Some(horizon))
            .await
            .context("retention sweep")?;

        if let Some(health) = &self.health {
            match self.incoming.pending(self.cfg.partition).await {
                Ok(pending) => health.incoming_pending.set(pending as f64),
                Err(e) => debug!(error = %e, "reading incoming backlog"),
            }
        }

        Ok(report)
    }

    /// Runs until `cancel` fires. Storage failures are logged and retried on
    /// the next tick; a conflicting commit stops the daemon.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.recover().await?;

        let mut drain_ticker = tokio::time::interval(self.cfg.drain_interval);
        drain_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep_ticker = tokio::time::interval(self.cfg.sweep_interval);
        sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut retention_ticker = tokio::time::interval(self.retention_interval);
        retention_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            partition = self.cfg.partition.index,
            partitions = self.cfg.partition.count,
            "aggregator started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = drain_ticker.tick() => {
                    if let Err(e) = self.drain_once().await {
                        warn!(error = %e, "drain failed");
                    }
                }
                _ = sweep_ticker.tick() => {
                    if let Err(e) = self.close_once().await {
                        if is_fatal(&e) {
                            error!(error = %e, "close sweep failed, stopping aggregator");
                            return Err(e);
                        }
                        error!(error = %e, "close sweep failed, aggregates kept for the next sweep");
                    }
                }
                _ = retention_ticker.tick() => {
                    if let Err(e) = self.retention_once().await {
                        warn!(error = %e, "retention sweep failed");
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Commits buckets already due and leaves open ones to be rebuilt from
    /// the incoming log on restart.
    async fn shutdown(&mut self) -> Result<()> {
        info!("aggregator stopping");

        let report = self.close_once().await?;
        self.retry_unacked().await;

        info!(
            committed = report.committed,
            pending_commits = report.pending,
            open_buckets = self.engine.open_buckets(),
            unacked = self.unacked.len(),
            "aggregator stopped"
        );

        Ok(())
    }

    /// Acknowledges folded samples, retrying within the ack budget. Handles
    /// that still fail are remembered for the next drain.
    async fn ack(&mut self, handles: Vec<Handle>) {
        if handles.is_empty() {
            return;
        }

        let mut backoff = RetryBackoff::new(&self.cfg.ack_retry);
        loop {
            match self.incoming.ack(&handles).await {
                Ok(_) => {
                    for handle in &handles {
                        self.unacked.remove(handle);
                    }
                    return;
                }
                Err(e) if backoff.exhausted() => {
                    error!(
                        handles = handles.len(),
                        attempts = backoff.attempt(),
                        error = %e,
                        "ack retry budget exhausted, deferring"
                    );
                    self.unacked.extend(handles);
                    return;
                }
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!(
                        handles = handles.len(),
                        attempt = backoff.attempt(),
                        retry_in = ?delay,
                        error = %e,
                        "ack failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn retry_unacked(&mut self) {
        if self.unacked.is_empty() {
            return;
        }
        let handles: Vec<Handle> = self.unacked.iter().copied().collect();
        match self.incoming.ack(&handles).await {
            Ok(_) => {
                info!(handles = handles.len(), "deferred acks succeeded");
                self.unacked.clear();
            }
            Err(e) => warn!(handles = handles.len(), error = %e, "deferred ack failed"),
        }
    }
}

fn is_fatal(e: &anyhow::Error) -> bool {
    e.downcast_ref::<CommitError>().is_some_and(CommitError::is_fatal)
}
