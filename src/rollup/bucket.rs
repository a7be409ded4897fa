use std::sync::Arc;
use std::time::Duration;

use crate::config::FrequencyConfig;
use crate::sample::{duration_millis, Timestamp};

/// A validated rollup granularity.
#[derive(Debug, Clone)]
pub struct Frequency {
    name: Arc<str>,
    width: Duration,
    width_ms: i64,
    retention: Option<Duration>,
}

impl Frequency {
    /// Builds a frequency. `width` must be at least one millisecond.
    pub fn new(name: &str, width: Duration, retention: Option<Duration>) -> Self {
        Self {
            name: Arc::from(name),
            width,
            width_ms: duration_millis(width).max(1),
            retention,
        }
    }

    pub fn from_config(cfg: &FrequencyConfig) -> Self {
        Self::new(&cfg.name, cfg.bucket_width, cfg.retention)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> Duration {
        self.width
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start(&self, ts: Timestamp) -> Timestamp {
        Timestamp::from_millis(ts.as_millis().div_euclid(self.width_ms) * self.width_ms)
    }

    /// Instant after which a bucket starting at `start` is past its grace
    /// period.
    pub fn closes_after(&self, start: Timestamp, grace: Duration) -> Timestamp {
        start
            .saturating_add(self.width)
            .saturating_add(grace)
    }

    /// Lowest bucket start that is still open at `now`.
    ///
    /// A bucket closes once `now - bucket_start > width + grace`, so every
    /// bucket starting below the returned boundary is closed.
    pub fn close_horizon(&self, now: Timestamp, grace: Duration) -> Timestamp {
        let edge = now.saturating_sub(grace).as_millis().saturating_sub(1);
        Timestamp::from_millis(edge.div_euclid(self.width_ms) * self.width_ms)
    }
}

/// Identity of one bucket: metric, frequency (by position in the configured
/// list) and bucket start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub metric: Arc<str>,
    pub frequency: usize,
    pub start: Timestamp,
}

impl BucketKey {
    pub fn new(metric: Arc<str>, frequency: usize, start: Timestamp) -> Self {
        Self {
            metric,
            frequency,
            start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten_seconds() -> Frequency {
        Frequency::new("tensecond", Duration::from_secs(10), None)
    }

    #[test]
    fn test_bucket_start_floors_to_width() {
        let f = ten_seconds();
        assert_eq!(f.bucket_start(Timestamp::from_millis(0)).as_millis(), 0);
        assert_eq!(f.bucket_start(Timestamp::from_millis(9_999)).as_millis(), 0);
        assert_eq!(f.bucket_start(Timestamp::from_millis(10_000)).as_millis(), 10_000);
        assert_eq!(f.bucket_start(Timestamp::from_millis(25_123)).as_millis(), 20_000);
    }

    #[test]
    fn test_bucket_start_before_epoch() {
        let f = ten_seconds();
        assert_eq!(f.bucket_start(Timestamp::from_millis(-1)).as_millis(), -10_000);
        assert_eq!(f.bucket_start(Timestamp::from_millis(-10_000)).as_millis(), -10_000);
    }

    #[test]
    fn test_close_horizon_is_strict() {
        let f = ten_seconds();
        let grace = Duration::from_secs(2);

        // Bucket [0, 10s) closes once now - 0 > 12s.
        assert_eq!(f.close_horizon(Timestamp::from_millis(12_000), grace).as_millis(), 0);
        assert_eq!(
            f.close_horizon(Timestamp::from_millis(12_001), grace).as_millis(),
            10_000
        );
        assert_eq!(
            f.closes_after(Timestamp::from_millis(0), grace).as_millis(),
            12_000
        );
    }

    #[test]
    fn test_close_horizon_without_grace() {
        let f = ten_seconds();
        assert_eq!(
            f.close_horizon(Timestamp::from_millis(20_000), Duration::ZERO).as_millis(),
            10_000
        );
        assert_eq!(
            f.close_horizon(Timestamp::from_millis(20_001), Duration::ZERO).as_millis(),
            20_000
        );
    }
}
