use std::fmt;
use std::str::FromStr;

use crate::sample::{MetricKind, Timestamp};

/// Finalized statistics for one closed bucket.
///
/// Rows are never emitted for empty buckets, so `n >= 1` and `avg == sum / n`.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub metric: String,
    pub frequency: String,
    pub bucket_start: Timestamp,
    pub kind: MetricKind,
    pub n: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl Aggregate {
    /// Value of a single statistic.
    pub fn stat(&self, stat: Stat) -> f64 {
        match stat {
            Stat::N => self.n as f64,
            Stat::Min => self.min,
            Stat::Max => self.max,
            Stat::Avg => self.avg,
            Stat::Sum => self.sum,
            Stat::Last => self.last,
            Stat::P50 => self.p50,
            Stat::P90 => self.p90,
            Stat::P99 => self.p99,
        }
    }
}

/// Selects one statistic column of an aggregate row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    N,
    Min,
    Max,
    Avg,
    Sum,
    Last,
    P50,
    P90,
    P99,
}

impl Stat {
    pub const ALL: [Stat; 9] = [
        Stat::N,
        Stat::Min,
        Stat::Max,
        Stat::Avg,
        Stat::Sum,
        Stat::Last,
        Stat::P50,
        Stat::P90,
        Stat::P99,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::N => "n",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Last => "last",
            Self::P50 => "p50",
            Self::P90 => "p90",
            Self::P99 => "p99",
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error returned when parsing an unknown statistic name.
#[derive(Debug, thiserror::Error)]
#[error("unknown stat {0:?}, expected one of n, min, max, avg, sum, last, p50, p90, p99")]
pub struct UnknownStat(pub String);

impl FromStr for Stat {
    type Err = UnknownStat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stat::ALL
            .into_iter()
            .find(|stat| stat.as_str() == s)
            .ok_or_else(|| UnknownStat(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_parse_all() {
        for stat in Stat::ALL {
            assert_eq!(stat.as_str().parse::<Stat>().ok(), Some(stat));
        }
        let err = "median".parse::<Stat>().unwrap_err();
        assert!(err.to_string().contains("median"));
    }

    #[test]
    fn test_stat_selects_field() {
        let agg = Aggregate {
            metric: "one".to_string(),
            frequency: "tensecond".to_string(),
            bucket_start: Timestamp::from_millis(0),
            kind: MetricKind::Gauge,
            n: 2,
            sum: 6.0,
            avg: 3.0,
            min: 1.0,
            max: 5.0,
            last: 5.0,
            p50: 3.0,
            p90: 4.6,
            p99: 4.96,
        };
        assert_eq!(agg.stat(Stat::N), 2.0);
        assert_eq!(agg.stat(Stat::Avg), 3.0);
        assert_eq!(agg.stat(Stat::P90), 4.6);
        assert_eq!(agg.stat(Stat::Last), 5.0);
    }
}
