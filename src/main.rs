use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use smalltsdb::clock::{Clock, SystemClock};
use smalltsdb::config::Config;
use smalltsdb::daemon::{AggregatorDaemon, IngestorDaemon};
use smalltsdb::export::health::HealthMetrics;
use smalltsdb::migrate::{Migrator, Schema, SqliteMigrator};
use smalltsdb::retention::RetentionManager;
use smalltsdb::rollup::{Aggregate, Frequency, RollupEngine, Stat};
use smalltsdb::sample::{MetricKind, Sample, Timestamp};
use smalltsdb::store::{IncomingStore, LongTermStore};

/// Time-series metrics rollup database.
#[derive(Parser)]
#[command(name = "smalltsdb", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the aggregator until SIGINT/SIGTERM.
    Aggregate,
    /// Append decoded samples read from stdin, one per line:
    /// `<metric> <kind> <value> [<timestamp ms>]`.
    Ingest,
    /// Apply schema migrations to both stores.
    Migrate {
        /// Report versions without applying anything.
        #[arg(long)]
        status: bool,
    },
    /// Print aggregates for one metric.
    Query {
        #[arg(long)]
        metric: String,
        #[arg(long)]
        frequency: String,
        /// Range start (epoch ms or RFC 3339). Default: one hour before end.
        #[arg(long)]
        start: Option<Timestamp>,
        /// Range end, inclusive (epoch ms or RFC 3339). Default: now.
        #[arg(long)]
        end: Option<Timestamp>,
        /// Print a single statistic instead of the full row.
        #[arg(long)]
        stat: Option<Stat>,
    },
    /// List metric names with stored aggregates.
    Metrics,
    /// Apply aggregate retention once.
    Sweep,
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("smalltsdb {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Aggregate => aggregate(cfg).await,
            Command::Ingest => ingest(cfg).await,
            Command::Migrate { status } => migrate(&cfg, status).await,
            Command::Query {
                metric,
                frequency,
                start,
                end,
                stat,
            } => query(&cfg, &metric, &frequency, start, end, stat).await,
            Command::Metrics => metrics(&cfg).await,
            Command::Sweep => sweep(&cfg).await,
            Command::Version => Ok(()),
        }
    })
}

async fn open_incoming(cfg: &Config, clock: Arc<dyn Clock>) -> Result<IncomingStore> {
    let store = IncomingStore::open(&cfg.storage, cfg.aggregator.lease, clock)
        .await
        .with_context(|| format!("opening {}", cfg.storage.incoming_path().display()))?;
    if cfg.storage.migrate {
        SqliteMigrator::new(store.pool().clone(), Schema::Incoming)
            .up()
            .await?;
    }
    Ok(store)
}

async fn open_longterm(cfg: &Config) -> Result<LongTermStore> {
    let store = LongTermStore::open(&cfg.storage)
        .await
        .with_context(|| format!("opening {}", cfg.storage.path.display()))?;
    if cfg.storage.migrate {
        SqliteMigrator::new(store.pool().clone(), Schema::LongTerm)
            .up()
            .await?;
    }
    Ok(store)
}

/// Cancels the returned token on SIGINT or SIGTERM.
fn shutdown_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }

        token.cancel();
    });

    cancel
}

async fn aggregate(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        partition = cfg.aggregator.partition.index,
        partitions = cfg.aggregator.partition.count,
        "starting aggregator",
    );

    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    if cfg.health.enabled {
        health
            .start()
            .await
            .context("starting health metrics server")?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let incoming = Arc::new(open_incoming(&cfg, Arc::clone(&clock)).await?);
    let longterm = Arc::new(open_longterm(&cfg).await?);
    let engine = Arc::new(RollupEngine::new(&cfg, clock.now()).with_health(Arc::clone(&health)));

    let daemon = AggregatorDaemon::new(&cfg, engine, incoming, longterm, clock)
        .with_health(Arc::clone(&health));

    let result = daemon.run(shutdown_signal()).await;

    health.stop().await?;
    tracing::info!("smalltsdb aggregator stopped");

    result
}

async fn ingest(cfg: Config) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let incoming = Arc::new(open_incoming(&cfg, Arc::clone(&clock)).await?);
    let (handle, daemon) = IngestorDaemon::new(&cfg.ingestor, incoming, None);

    let cancel = shutdown_signal();
    let task = tokio::spawn(daemon.run(cancel.clone()));

    let batch_size = cfg.aggregator.drain_batch_size;
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<Sample>>(4);

    let reader = tokio::task::spawn_blocking(move || -> Result<usize> {
        let stdin = std::io::stdin();
        let mut batch = Vec::with_capacity(batch_size);
        let mut skipped = 0usize;

        for (lineno, line) in stdin.lock().lines().enumerate() {
            let line = line.context("reading stdin")?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line, clock.now()) {
                Ok(sample) => batch.push(sample),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(line = lineno + 1, error = %e, "skipping line");
                }
            }
            if batch.len() >= batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                if tx.blocking_send(full).is_err() {
                    break;
                }
            }
        }
        if !batch.is_empty() {
            let _ = tx.blocking_send(batch);
        }

        Ok(skipped)
    });

    while let Some(batch) = rx.recv().await {
        match handle.submit(batch).await {
            Ok(submitted) => tracing::debug!(
                accepted = submitted.accepted,
                rejected = submitted.rejected,
                "submitted batch"
            ),
            Err(e) => {
                tracing::warn!(error = %e, "ingestor closed, discarding remaining input");
                break;
            }
        }
    }
    drop(rx);

    let skipped = reader.await.context("joining stdin reader")??;
    let stats = handle.stats();
    let (submitted, rejected) = (stats.submitted(), stats.rejected());
    drop(handle);

    task.await.context("joining ingestor")??;
    cancel.cancel();

    tracing::info!(submitted, rejected, skipped, "ingest finished");

    Ok(())
}

/// Parses `<metric> <kind> <value> [<timestamp ms>]`.
fn parse_line(line: &str, now: Timestamp) -> Result<Sample> {
    let mut fields = line.split_whitespace();
    let metric = fields.next().context("missing metric name")?;
    let kind: MetricKind = fields.next().context("missing kind")?.parse()?;
    let value: f64 = fields
        .next()
        .context("missing value")?
        .parse()
        .context("parsing value")?;
    let timestamp = match fields.next() {
        Some(ts) => ts.parse()?,
        None => now,
    };

    Ok(Sample::new(metric, kind, value, timestamp))
}

async fn migrate(cfg: &Config, status: bool) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let incoming = IncomingStore::open(&cfg.storage, cfg.aggregator.lease, clock).await?;
    let longterm = LongTermStore::open(&cfg.storage).await?;

    let migrators = [
        SqliteMigrator::new(incoming.pool().clone(), Schema::Incoming),
        SqliteMigrator::new(longterm.pool().clone(), Schema::LongTerm),
    ];

    for (schema, migrator) in [Schema::Incoming, Schema::LongTerm].into_iter().zip(&migrators) {
        if !status {
            migrator.up().await?;
        }
        let (version, dirty) = migrator.status().await?;
        println!("{:<10} version {version}{}", schema.as_str(), if dirty { " (dirty)" } else { "" });
    }

    Ok(())
}

async fn query(
    cfg: &Config,
    metric: &str,
    frequency: &str,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
    stat: Option<Stat>,
) -> Result<()> {
    if !cfg.frequencies.iter().any(|f| f.name == frequency) {
        anyhow::bail!("unknown frequency {frequency:?}");
    }

    let end = end.unwrap_or_else(|| SystemClock.now());
    let start = start.unwrap_or_else(|| end.saturating_sub(std::time::Duration::from_secs(3600)));
    let store = open_longterm(cfg).await?;

    if let Some(stat) = stat {
        let series = store.query_stat(metric, frequency, stat, start, end).await?;
        println!("{:<26} {:>14}", "bucket_start", stat);
        for (ts, value) in series {
            println!("{:<26} {value:>14.4}", ts.to_string());
        }
        return Ok(());
    }

    let rows: Vec<Aggregate> = store
        .query(metric, frequency, start, end)
        .try_collect()
        .await?;

    print!("{:<26}", "bucket_start");
    for stat in Stat::ALL {
        print!(" {:>12}", stat);
    }
    println!();
    for row in &rows {
        print!("{:<26}", row.bucket_start.to_string());
        for stat in Stat::ALL {
            print!(" {:>12.4}", row.stat(stat));
        }
        println!();
    }

    Ok(())
}

async fn metrics(cfg: &Config) -> Result<()> {
    let store = open_longterm(cfg).await?;
    for name in store.list_metrics().await? {
        println!("{name}");
    }
    Ok(())
}

async fn sweep(cfg: &Config) -> Result<()> {
    let store = Arc::new(open_longterm(cfg).await?);
    let frequencies = cfg.frequencies.iter().map(Frequency::from_config).collect();
    let manager = RetentionManager::new(store, frequencies, cfg.retention.batch_size);

    let report = manager.sweep(SystemClock.now(), None).await?;
    println!(
        "deleted {} aggregates in {:?}",
        report.aggregates_deleted, report.elapsed
    );

    Ok(())
}
