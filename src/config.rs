use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for smalltsdb processes.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Rollup frequencies, finest first.
    #[serde(default = "default_frequencies")]
    pub frequencies: Vec<FrequencyConfig>,

    /// Out-of-order tolerance before a bucket closes. Default: 5s.
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// How gauge samples fold into a bucket. Default: statistical.
    #[serde(default)]
    pub gauge_policy: GaugePolicy,

    /// Quantile sketch accuracy configuration.
    #[serde(default)]
    pub sketch: SketchConfig,

    /// Location and connection settings for both durable stores.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Aggregator daemon configuration.
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Ingestor daemon configuration.
    #[serde(default)]
    pub ingestor: IngestorConfig,

    /// Retention sweep configuration.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// One rollup granularity.
#[derive(Debug, Clone, Deserialize)]
pub struct FrequencyConfig {
    /// Stable identifier stored with every aggregate row (e.g. "tensecond").
    pub name: String,

    /// Width of each bucket.
    #[serde(with = "humantime_serde")]
    pub bucket_width: Duration,

    /// How long aggregate rows are kept. Omitted means forever.
    #[serde(default, with = "humantime_serde")]
    pub retention: Option<Duration>,
}

/// Gauge folding policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugePolicy {
    /// Fold every gauge sample as a statistical observation.
    #[default]
    Statistical,
    /// Report only the latest gauge value in each bucket.
    Last,
}

/// Quantile sketch configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SketchConfig {
    /// Maximum relative error of reported percentiles. Default: 0.01.
    #[serde(default = "default_relative_accuracy")]
    pub relative_accuracy: f64,

    /// Upper bound on sketch bins per bucket. Default: 2048.
    #[serde(default = "default_max_bins")]
    pub max_bins: usize,
}

/// Durable store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Long-term (aggregates) database file. Default: "smalltsdb.db".
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Incoming (raw samples) database file. Default: "<path>.incoming".
    #[serde(default)]
    pub incoming_path: Option<PathBuf>,

    /// Maximum pooled connections per database. Default: 4.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a statement waits on a locked database. Default: 5s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// How long to wait for a pooled connection. Default: 10s.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Apply pending schema migrations on start. Default: true.
    #[serde(default = "default_true")]
    pub migrate: bool,
}

/// Aggregator daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Maximum samples per drain. Default: 5000.
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,

    /// Pause between drains. Default: 250ms.
    #[serde(default = "default_drain_interval", with = "humantime_serde")]
    pub drain_interval: Duration,

    /// Bucket close sweep interval. Default: 1s.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// How long drained samples stay reserved before redelivery. Default: 60s.
    #[serde(default = "default_lease", with = "humantime_serde")]
    pub lease: Duration,

    /// Drains performed right before committing closing buckets. Default: 4.
    #[serde(default = "default_final_flush_batches")]
    pub final_flush_batches: usize,

    /// Static share of the sample stream owned by this instance.
    #[serde(default)]
    pub partition: Partition,

    /// Backoff for failed aggregate commits.
    #[serde(default)]
    pub commit_retry: RetryConfig,

    /// Backoff for failed acknowledgements.
    #[serde(default)]
    pub ack_retry: RetryConfig,
}

/// Static partition of the metric space: an instance owns samples whose
/// shard satisfies `shard % count == index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Partition {
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_partition_count")]
    pub count: u32,
}

/// Retry policy shared by store writers.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    /// First retry delay. Default: 100ms.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Retry delay cap. Default: 10s.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Failures after which the error is reported as persistent. Default: 8.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Ingestor daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestorConfig {
    /// Queued sample batches before producers block. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Backoff for failed appends.
    #[serde(default)]
    pub append_retry: RetryConfig,
}

/// Retention sweep configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Sweep interval. Default: 60s.
    #[serde(default = "default_retention_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Rows deleted per statement. Default: 10000.
    #[serde(default = "default_retention_batch_size")]
    pub batch_size: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_frequencies() -> Vec<FrequencyConfig> {
    const HOUR: u64 = 3600;
    const DAY: u64 = 24 * HOUR;

    let freq = |name: &str, width: u64, retention: Option<u64>| FrequencyConfig {
        name: name.to_string(),
        bucket_width: Duration::from_secs(width),
        retention: retention.map(Duration::from_secs),
    };

    vec![
        freq("onesecond", 1, Some(HOUR)),
        freq("tensecond", 10, Some(DAY)),
        freq("oneminute", 60, Some(7 * DAY)),
        freq("fiveminute", 300, Some(30 * DAY)),
        freq("onehour", HOUR, Some(365 * DAY)),
        freq("oneday", DAY, None),
    ]
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_relative_accuracy() -> f64 {
    0.01
}

fn default_max_bins() -> usize {
    2048
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("smalltsdb.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_drain_batch_size() -> usize {
    5000
}

fn default_drain_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_lease() -> Duration {
    Duration::from_secs(60)
}

fn default_final_flush_batches() -> usize {
    4
}

fn default_partition_count() -> u32 {
    1
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    8
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_retention_batch_size() -> usize {
    10_000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            frequencies: default_frequencies(),
            grace_period: default_grace_period(),
            gauge_policy: GaugePolicy::default(),
            sketch: SketchConfig::default(),
            storage: StorageConfig::default(),
            aggregator: AggregatorConfig::default(),
            ingestor: IngestorConfig::default(),
            retention: RetentionConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            relative_accuracy: default_relative_accuracy(),
            max_bins: default_max_bins(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            incoming_path: None,
            max_connections: default_max_connections(),
            busy_timeout: default_busy_timeout(),
            acquire_timeout: default_acquire_timeout(),
            migrate: true,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            drain_batch_size: default_drain_batch_size(),
            drain_interval: default_drain_interval(),
            sweep_interval: default_sweep_interval(),
            lease: default_lease(),
            final_flush_batches: default_final_flush_batches(),
            partition: Partition::default(),
            commit_retry: RetryConfig::default(),
            ack_retry: RetryConfig::default(),
        }
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self { index: 0, count: 1 }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            append_retry: RetryConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: default_retention_interval(),
            batch_size: default_retention_batch_size(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_frequencies()?;

        let sketch = &self.sketch;
        if !(sketch.relative_accuracy > 0.0 && sketch.relative_accuracy < 1.0) {
            bail!(
                "sketch.relative_accuracy must be in (0, 1), got {}",
                sketch.relative_accuracy
            );
        }
        if sketch.max_bins < 16 {
            bail!("sketch.max_bins must be at least 16");
        }

        if self.storage.max_connections == 0 {
            bail!("storage.max_connections must be positive");
        }
        if self.storage.path.as_os_str().is_empty() {
            bail!("storage.path is required");
        }
        if self.storage.incoming_path() == self.storage.path {
            bail!("storage.incoming_path must differ from storage.path");
        }

        let agg = &self.aggregator;
        if agg.drain_batch_size == 0 {
            bail!("aggregator.drain_batch_size must be positive");
        }
        if agg.drain_interval.is_zero() {
            bail!("aggregator.drain_interval must be positive");
        }
        if agg.sweep_interval.is_zero() {
            bail!("aggregator.sweep_interval must be positive");
        }
        if agg.lease.is_zero() {
            bail!("aggregator.lease must be positive");
        }
        if agg.partition.count == 0 {
            bail!("aggregator.partition.count must be positive");
        }
        if agg.partition.index >= agg.partition.count {
            bail!(
                "aggregator.partition.index {} must be below partition.count {}",
                agg.partition.index,
                agg.partition.count
            );
        }
        agg.commit_retry.validate("aggregator.commit_retry")?;
        agg.ack_retry.validate("aggregator.ack_retry")?;

        if self.ingestor.channel_capacity == 0 {
            bail!("ingestor.channel_capacity must be positive");
        }
        self.ingestor.append_retry.validate("ingestor.append_retry")?;

        if self.retention.interval.is_zero() {
            bail!("retention.interval must be positive");
        }
        if self.retention.batch_size == 0 {
            bail!("retention.batch_size must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }

    fn validate_frequencies(&self) -> Result<()> {
        if self.frequencies.is_empty() {
            bail!("at least one frequency is required");
        }

        let mut names = HashSet::new();
        let mut previous: Option<&FrequencyConfig> = None;

        for freq in &self.frequencies {
            if freq.name.is_empty() {
                bail!("frequency name is required");
            }
            if !freq
                .name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
            {
                bail!(
                    "frequency name {:?} may only contain [a-z0-9_]",
                    freq.name
                );
            }
            if !names.insert(freq.name.as_str()) {
                bail!("duplicate frequency name: {}", freq.name);
            }

            let width_ms = freq.bucket_width.as_millis();
            if width_ms == 0 {
                bail!("frequency {} bucket_width must be positive", freq.name);
            }
            if freq.bucket_width.subsec_nanos() % 1_000_000 != 0 {
                bail!(
                    "frequency {} bucket_width must be a whole number of milliseconds",
                    freq.name
                );
            }

            if let Some(retention) = freq.retention {
                if retention < freq.bucket_width {
                    bail!(
                        "frequency {} retention {:?} must be at least its bucket_width {:?}",
                        freq.name,
                        retention,
                        freq.bucket_width
                    );
                }
            }

            if let Some(prev) = previous {
                if freq.bucket_width <= prev.bucket_width {
                    bail!(
                        "frequency {} bucket_width {:?} must be greater than {} bucket_width {:?}",
                        freq.name,
                        freq.bucket_width,
                        prev.name,
                        prev.bucket_width
                    );
                }
                if width_ms % prev.bucket_width.as_millis() != 0 {
                    bail!(
                        "frequency {} bucket_width {:?} must be an exact multiple of {} bucket_width {:?}",
                        freq.name,
                        freq.bucket_width,
                        prev.name,
                        prev.bucket_width
                    );
                }
            }

            previous = Some(freq);
        }

        Ok(())
    }
}

impl StorageConfig {
    /// Resolved incoming database path.
    pub fn incoming_path(&self) -> PathBuf {
        match &self.incoming_path {
            Some(path) => path.clone(),
            None => {
                let mut name = self.path.clone().into_os_string();
                name.push(".incoming");
                PathBuf::from(name)
            }
        }
    }
}

impl RetryConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.initial_backoff.is_zero() {
            bail!("{section}.initial_backoff must be positive");
        }
        if self.max_backoff < self.initial_backoff {
            bail!("{section}.max_backoff must not be below initial_backoff");
        }
        if self.max_attempts == 0 {
            bail!("{section}.max_attempts must be positive");
        }
        Ok(())
    }
}
