use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

/// Milliseconds since the Unix epoch.
///
/// All bucket arithmetic happens on this integer representation so bucket
/// boundaries are exact and identical across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Converts wall-clock time, mapping pre-epoch instants to negative values.
    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(duration_millis(d)),
            Err(e) => Self(-duration_millis(e.duration())),
        }
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(d)))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(d)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Error returned when a timestamp is neither epoch milliseconds nor RFC 3339.
#[derive(Debug, thiserror::Error)]
#[error("invalid timestamp {0:?}, expected epoch milliseconds or RFC 3339")]
pub struct InvalidTimestamp(pub String);

impl FromStr for Timestamp {
    type Err = InvalidTimestamp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(Self(ms));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.timestamp_millis()))
            .map_err(|_| InvalidTimestamp(s.to_string()))
    }
}

/// Whole milliseconds in `d`, saturating at `i64::MAX`.
pub(crate) fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Statsd-style metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Delta since the previous report.
    Counter,
    /// Point-in-time level.
    Gauge,
    /// Duration measurement.
    Timer,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Timer => "timer",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown metric kind.
#[derive(Debug, thiserror::Error)]
#[error("unknown metric kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for MetricKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" | "c" => Ok(Self::Counter),
            "gauge" | "g" => Ok(Self::Gauge),
            "timer" | "ms" => Ok(Self::Timer),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// One decoded metric observation.
///
/// Immutable once built; the metric name is shared so fanning a sample out to
/// every configured frequency does not copy the string.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    metric: Arc<str>,
    kind: MetricKind,
    value: f64,
    timestamp: Timestamp,
}

impl Sample {
    pub fn new(
        metric: impl Into<Arc<str>>,
        kind: MetricKind,
        value: f64,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            metric: metric.into(),
            kind,
            value,
            timestamp,
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub(crate) fn metric_arc(&self) -> &Arc<str> {
        &self.metric
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Whether the value can be stored and aggregated (not NaN or infinite).
    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
    }
}
