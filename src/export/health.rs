use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "smalltsdb";

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "smalltsdb" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Samples handed to the rollup engine.
    pub samples_ingested: Counter,
    /// Samples durably appended to the incoming store.
    pub samples_appended: Counter,
    /// Samples rejected before storage (non-finite values).
    pub samples_rejected: Counter,
    /// Append attempts that failed and were retried.
    pub append_retries: Counter,
    /// Unconsumed samples in this instance's partition.
    pub incoming_pending: Gauge,
    /// Samples per drain.
    pub drain_batch_size: Histogram,

    // === Rollup ===
    /// Bucket folds rejected because the bucket had already closed.
    pub samples_late_dropped: Counter,
    /// Aggregates committed by frequency.
    pub buckets_committed: CounterVec,
    /// Commit attempts that failed and were scheduled again.
    pub commit_retries: Counter,
    /// Commits that exhausted their retry budget.
    pub commit_failures: Counter,
    /// Accumulators currently held in memory.
    pub buckets_open: Gauge,
    /// Closed buckets still waiting for a successful commit.
    pub buckets_overdue: Gauge,

    // === Retention ===
    /// Rows removed by retention, by kind (aggregates/samples).
    pub retention_deleted: CounterVec,
    /// Sweep duration by phase (close/retention).
    pub sweep_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples_ingested = Counter::with_opts(
            Opts::new(
                "samples_ingested_total",
                "Samples handed to the rollup engine.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_appended = Counter::with_opts(
            Opts::new(
                "samples_appended_total",
                "Samples durably appended to the incoming store.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_rejected = Counter::with_opts(
            Opts::new(
                "samples_rejected_total",
                "Samples rejected before storage because their value is not finite.",
            )
            .namespace(NAMESPACE),
        )?;
        let append_retries = Counter::with_opts(
            Opts::new(
                "append_retries_total",
                "Incoming store appends that failed and were retried.",
            )
            .namespace(NAMESPACE),
        )?;
        let incoming_pending = Gauge::with_opts(
            Opts::new(
                "incoming_pending",
                "Unconsumed samples in this aggregator's partition.",
            )
            .namespace(NAMESPACE),
        )?;
        let drain_batch_size = Histogram::with_opts(
            HistogramOpts::new("drain_batch_size", "Samples per incoming store drain.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    1.0, 10.0, 100.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 50000.0,
                ]),
        )?;

        let samples_late_dropped = Counter::with_opts(
            Opts::new(
                "samples_late_dropped_total",
                "Bucket folds rejected because the bucket had already closed.",
            )
            .namespace(NAMESPACE),
        )?;
        let buckets_committed = CounterVec::new(
            Opts::new(
                "buckets_committed_total",
                "Aggregates committed to the long-term store by frequency.",
            )
            .namespace(NAMESPACE),
            &["frequency"],
        )?;
        let commit_retries = Counter::with_opts(
            Opts::new(
                "commit_retries_total",
                "Aggregate commits that failed and were scheduled again.",
            )
            .namespace(NAMESPACE),
        )?;
        let commit_failures = Counter::with_opts(
            Opts::new(
                "commit_failures_total",
                "Aggregate commits that exhausted their retry budget.",
            )
            .namespace(NAMESPACE),
        )?;
        let buckets_open = Gauge::with_opts(
            Opts::new("buckets_open", "Accumulators currently held in memory.")
                .namespace(NAMESPACE),
        )?;
        let buckets_overdue = Gauge::with_opts(
            Opts::new(
                "buckets_overdue",
                "Closed buckets still waiting for a successful commit.",
            )
            .namespace(NAMESPACE),
        )?;

        let retention_deleted = CounterVec::new(
            Opts::new(
                "retention_deleted_total",
                "Rows removed by retention sweeps by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let sweep_duration = HistogramVec::new(
            HistogramOpts::new("sweep_duration_seconds", "Sweep duration by phase.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
            &["phase"],
        )?;

        registry.register(Box::new(samples_ingested.clone()))?;
        registry.register(Box::new(samples_appended.clone()))?;
        registry.register(Box::new(samples_rejected.clone()))?;
        registry.register(Box::new(append_retries.clone()))?;
        registry.register(Box::new(incoming_pending.clone()))?;
        registry.register(Box::new(drain_batch_size.clone()))?;
        registry.register(Box::new(samples_late_dropped.clone()))?;
        registry.register(Box::new(buckets_committed.clone()))?;
        registry.register(Box::new(commit_retries.clone()))?;
        registry.register(Box::new(commit_failures.clone()))?;
        registry.register(Box::new(buckets_open.clone()))?;
        registry.register(Box::new(buckets_overdue.clone()))?;
        registry.register(Box::new(retention_deleted.clone()))?;
        registry.register(Box::new(sweep_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples_ingested,
            samples_appended,
            samples_rejected,
            append_retries,
            incoming_pending,
            drain_batch_size,
            samples_late_dropped,
            buckets_committed,
            commit_retries,
            commit_failures,
            buckets_open,
            buckets_overdue,
            retention_deleted,
            sweep_duration,
        })
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
