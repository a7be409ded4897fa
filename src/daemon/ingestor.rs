use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryBackoff;
use crate::config::{IngestorConfig, RetryConfig};
use crate::export::health::HealthMetrics;
use crate::sample::Sample;
use crate::store::{Ack, IncomingStore, StoreError};

/// Durable log the ingestor appends sample batches to.
pub trait SampleLog: Send + Sync + 'static {
    /// Stores every sample of `batch` or none of them.
    fn append(&self, batch: &[Sample]) -> impl Future<Output = Result<Ack, StoreError>> + Send;
}

impl SampleLog for IncomingStore {
    fn append(&self, batch: &[Sample]) -> impl Future<Output = Result<Ack, StoreError>> + Send {
        IncomingStore::append(self, batch)
    }
}

/// Counters shared by an ingestor and its handles.
#[derive(Debug, Default)]
pub struct IngestorStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    appended: AtomicU64,
    append_retries: AtomicU64,
}

impl IngestorStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn append_retries(&self) -> u64 {
        self.append_retries.load(Ordering::Relaxed)
    }
}

/// Result of handing a batch to the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub accepted: usize,
    /// Samples dropped because their value is NaN or infinite.
    pub rejected: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("ingestor stopped")]
    Closed,
}

/// Producer side of an ingestor. Cheap to clone.
///
/// `submit` waits while the queue is full, so storage backpressure surfaces
/// as submit latency.
#[derive(Clone)]
pub struct IngestorHandle {
    tx: mpsc::Sender<Vec<Sample>>,
    stats: Arc<IngestorStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl IngestorHandle {
    pub async fn submit(&self, mut batch: Vec<Sample>) -> Result<Submitted, IngestError> {
        let before = batch.len();
        batch.retain(Sample::is_finite);
        let rejected = before - batch.len();

        if rejected > 0 {
            self.stats.rejected.fetch_add(rejected as u64, Ordering::Relaxed);
            if let Some(health) = &self.health {
                health.samples_rejected.inc_by(rejected as f64);
            }
            tracing::debug!(rejected, "rejected non-finite samples");
        }

        let accepted = batch.len();
        if accepted > 0 {
            self.tx.send(batch).await.map_err(|_| IngestError::Closed)?;
            self.stats.submitted.fetch_add(accepted as u64, Ordering::Relaxed);
        }

        Ok(Submitted { accepted, rejected })
    }

    pub fn stats(&self) -> &IngestorStats {
        &self.stats
    }
}

/// Appends queued sample batches to the incoming store.
pub struct IngestorDaemon<L = IncomingStore> {
    rx: mpsc::Receiver<Vec<Sample>>,
    incoming: Arc<L>,
    retry: RetryConfig,
    stats: Arc<IngestorStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl<L: SampleLog> IngestorDaemon<L> {
    /// Creates a daemon and the handle producers submit through.
    pub fn new(
        cfg: &IngestorConfig,
        incoming: Arc<L>,
        health: Option<Arc<HealthMetrics>>,
    ) -> (IngestorHandle, Self) {
        let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let stats = Arc::new(IngestorStats::default());

        let handle = IngestorHandle {
            tx,
            stats: Arc::clone(&stats),
            health: health.clone(),
        };
        let daemon = Self {
            rx,
            incoming,
            retry: cfg.append_retry,
            stats,
            health,
        };

        (handle, daemon)
    }

    /// Appends batches until cancelled or every handle is dropped. On
    /// cancellation, batches already queued are appended before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("ingestor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.rx.recv() => match batch {
                    Some(batch) => self.append(&batch, &cancel).await?,
                    None => {
                        tracing::info!("all producers gone, ingestor stopping");
                        return Ok(());
                    }
                },
            }
        }

        self.rx.close();
        let mut flushed = 0usize;
        while let Some(batch) = self.rx.recv().await {
            flushed += batch.len();
            self.append(&batch, &cancel).await?;
        }

        tracing::info!(flushed, "ingestor stopped");

        Ok(())
    }

    /// Appends one batch, retrying until it is stored. During shutdown the
    /// retry budget bounds how long a failing store can hold the process.
    async fn append(&self, batch: &[Sample], cancel: &CancellationToken) -> Result<()> {
        let mut backoff = RetryBackoff::new(&self.retry);
        let mut reported = false;

        loop {
            let err = match self.incoming.append(batch).await {
                Ok(ack) => {
                    self.stats
                        .appended
                        .fetch_add(ack.accepted as u64, Ordering::Relaxed);
                    if let Some(health) = &self.health {
                        health.samples_appended.inc_by(ack.accepted as f64);
                    }
                    if backoff.started() {
                        tracing::info!(attempts = backoff.attempt() + 1, "append succeeded after retries");
                    }
                    return Ok(());
                }
                Err(e @ StoreError::NonFinite { .. }) => {
                    self.stats
                        .rejected
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    tracing::error!(samples = batch.len(), error = %e, "store refused batch, dropping it");
                    return Ok(());
                }
                Err(e) => e,
            };

            let delay = backoff.next_backoff();
            self.stats.append_retries.fetch_add(1, Ordering::Relaxed);
            if let Some(health) = &self.health {
                health.append_retries.inc();
            }

            if backoff.exhausted() {
                if cancel.is_cancelled() {
                    tracing::error!(
                        samples = batch.len(),
                        attempts = backoff.attempt(),
                        error = %err,
                        "abandoning batch during shutdown, samples are lost"
                    );
                    bail!(
                        "abandoning {} samples after {} append attempts during shutdown: {err}",
                        batch.len(),
                        backoff.attempt()
                    );
                }
                if !reported {
                    reported = true;
                    tracing::error!(
                        samples = batch.len(),
                        attempts = backoff.attempt(),
                        transient = err.is_transient(),
                        error = %err,
                        "append retry budget exhausted, still retrying"
                    );
                }
            } else {
                tracing::warn!(
                    samples = batch.len(),
                    attempt = backoff.attempt(),
                    retry_in = ?delay,
                    error = %err,
                    "append failed"
                );
            }

            tokio::time::sleep(delay).await;
        }
    }
}
