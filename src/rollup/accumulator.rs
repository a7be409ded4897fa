use crate::config::{GaugePolicy, SketchConfig};
use crate::sample::{MetricKind, Sample, Timestamp};

use super::aggregate::Aggregate;
use super::bucket::{BucketKey, Frequency};
use super::sketch::QuantileSketch;

/// Streaming statistics for one open bucket.
///
/// Not internally synchronized: the engine only touches an accumulator while
/// holding its bucket's map entry.
///
/// Folding is order independent, including the reported kind: a bucket that
/// sees several kinds reports the first of `counter, gauge, timer` present,
/// and the gauge `last` policy only applies to buckets holding gauges alone.
#[derive(Debug, Clone)]
pub struct Accumulator {
    /// Bit set of kinds folded so far.
    kinds: u8,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
    last_at: Timestamp,
    sketch: QuantileSketch,
}

impl Accumulator {
    pub fn new(sketch: &SketchConfig) -> Self {
        Self {
            kinds: 0,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: 0.0,
            last_at: Timestamp::from_millis(i64::MIN),
            sketch: QuantileSketch::new(sketch),
        }
    }

    /// Folds one sample. Counter deltas, gauge levels and timer durations all
    /// fold the same way; the gauge policy is applied at finalization.
    ///
    /// Returns false, leaving the accumulator untouched, for NaN or infinite
    /// values.
    pub fn fold(&mut self, sample: &Sample) -> bool {
        let value = sample.value();
        if !value.is_finite() {
            return false;
        }

        self.kinds |= kind_bit(sample.kind());
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sketch.insert(value);

        // Ties go to the later arrival.
        if sample.timestamp() >= self.last_at {
            self.last = value;
            self.last_at = sample.timestamp();
        }

        true
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Reported kind. Empty accumulators report `Counter`.
    pub fn kind(&self) -> MetricKind {
        KINDS
            .into_iter()
            .find(|kind| self.kinds & kind_bit(*kind) != 0)
            .unwrap_or(MetricKind::Counter)
    }

    /// Whether samples of more than one kind were folded.
    pub fn is_mixed(&self) -> bool {
        self.kinds.count_ones() > 1
    }

    /// Produces the immutable row for this bucket.
    pub fn finish(self, key: &BucketKey, frequency: &Frequency, policy: GaugePolicy) -> Aggregate {
        let mut agg = Aggregate {
            metric: key.metric.to_string(),
            frequency: frequency.name().to_string(),
            bucket_start: key.start,
            kind: self.kind(),
            n: self.count,
            sum: self.sum,
            avg: 0.0,
            min: self.min,
            max: self.max,
            last: self.last,
            p50: self.sketch.quantile(0.5).unwrap_or(self.min),
            p90: self.sketch.quantile(0.9).unwrap_or(self.min),
            p99: self.sketch.quantile(0.99).unwrap_or(self.min),
        };

        if self.kinds == kind_bit(MetricKind::Gauge) && policy == GaugePolicy::Last {
            let last = self.last;
            agg.n = 1;
            agg.sum = last;
            agg.min = last;
            agg.max = last;
            agg.p50 = last;
            agg.p90 = last;
            agg.p99 = last;
        }

        agg.avg = if agg.n == 0 {
            0.0
        } else {
            agg.sum / agg.n as f64
        };

        agg
    }
}

const KINDS: [MetricKind; 3] = [MetricKind::Counter, MetricKind::Gauge, MetricKind::Timer];

fn kind_bit(kind: MetricKind) -> u8 {
    match kind {
        MetricKind::Counter => 1,
        MetricKind::Gauge => 2,
        MetricKind::Timer => 4,
    }
}
