use std::collections::BTreeMap;

use crate::config::SketchConfig;

/// Magnitudes below this are counted as zero.
const MIN_MAGNITUDE: f64 = 1e-9;

/// Bounded-memory quantile sketch with a relative error guarantee.
///
/// Values are counted in logarithmic bins: with relative accuracy `a` and
/// `gamma = (1 + a) / (1 - a)`, bin `i` holds magnitudes in
/// `(gamma^(i-1), gamma^i]` and reports `2 * gamma^i / (gamma + 1)`. Every
/// value in a bin is within relative error `a` of that representative, so a
/// reported quantile is within `a` of the true value of the same rank.
///
/// Positive and negative magnitudes live in separate bin maps. Once the total
/// bin count exceeds `max_bins`, the lowest-magnitude bins are merged into
/// their neighbour, which degrades accuracy only for the smallest values.
/// Quantiles interpolate between neighbouring order statistics the way a
/// linear-interpolated exact percentile does, so small buckets report the
/// familiar values (p90 of `[1, 5]` is about 4.6).
/// With the defaults (1 %, 2048 bins) that happens only when a single bucket
/// spans more than 17 orders of magnitude.
#[derive(Debug, Clone)]
pub struct QuantileSketch {
    ln_gamma: f64,
    max_bins: usize,
    positive: BTreeMap<i32, u64>,
    negative: BTreeMap<i32, u64>,
    zero: u64,
    count: u64,
    min: f64,
    max: f64,
}

impl QuantileSketch {
    pub fn new(cfg: &SketchConfig) -> Self {
        let alpha = cfg.relative_accuracy;
        let gamma = (1.0 + alpha) / (1.0 - alpha);
        Self {
            ln_gamma: gamma.ln(),
            max_bins: cfg.max_bins.max(2),
            positive: BTreeMap::new(),
            negative: BTreeMap::new(),
            zero: 0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Adds one finite value. Non-finite values are ignored.
    pub fn insert(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }

        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let magnitude = value.abs();
        if magnitude < MIN_MAGNITUDE {
            self.zero += 1;
            return;
        }

        let idx = self.index(magnitude);
        let store = if value > 0.0 {
            &mut self.positive
        } else {
            &mut self.negative
        };
        *store.entry(idx).or_insert(0) += 1;

        if self.positive.len() + self.negative.len() > self.max_bins {
            self.collapse();
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of occupied bins.
    pub fn bins(&self) -> usize {
        self.positive.len() + self.negative.len() + usize::from(self.zero > 0)
    }

    /// Estimated value at quantile `q` in `[0, 1]`, or `None` when empty.
    ///
    /// Interpolates linearly between the order statistics around rank
    /// `q * (n - 1)`. Each order statistic is the representative of the bin
    /// holding it, clamped to the exact minimum and maximum.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }

        let rank = q.clamp(0.0, 1.0) * (self.count - 1) as f64;
        let lower = rank.floor();
        let frac = rank - lower;

        let lo = self.value_at(lower as u64);
        if frac == 0.0 {
            return Some(lo);
        }

        let hi = self.value_at(lower as u64 + 1);
        Some(lo + (hi - lo) * frac)
    }

    /// Approximate `k`-th smallest value (zero based).
    fn value_at(&self, k: u64) -> f64 {
        let mut seen = 0u64;

        // Most negative first: highest magnitude index in the negative store.
        for (&idx, &n) in self.negative.iter().rev() {
            seen += n;
            if seen > k {
                return self.clamp(-self.value(idx));
            }
        }

        seen += self.zero;
        if self.zero > 0 && seen > k {
            return self.clamp(0.0);
        }

        for (&idx, &n) in &self.positive {
            seen += n;
            if seen > k {
                return self.clamp(self.value(idx));
            }
        }

        self.max
    }

    fn index(&self, magnitude: f64) -> i32 {
        (magnitude.ln() / self.ln_gamma).ceil() as i32
    }

    fn value(&self, idx: i32) -> f64 {
        let gamma = self.ln_gamma.exp();
        2.0 * (f64::from(idx) * self.ln_gamma).exp() / (gamma + 1.0)
    }

    fn clamp(&self, v: f64) -> f64 {
        v.clamp(self.min, self.max)
    }

    /// Merges the lowest-magnitude bin of the larger store into the next one.
    fn collapse(&mut self) {
        let store = if self.positive.len() >= self.negative.len() {
            &mut self.positive
        } else {
            &mut self.negative
        };

        if let Some((_, lowest)) = store.pop_first() {
            match store.first_entry() {
                Some(mut next) => *next.get_mut() += lowest,
                None => self.zero += lowest,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch() -> QuantileSketch {
        QuantileSketch::new(&SketchConfig::default())
    }

    fn relative_error(estimate: f64, truth: f64) -> f64 {
        ((estimate - truth) / truth).abs()
    }

    #[test]
    fn test_empty_sketch_has_no_quantiles() {
        let s = sketch();
        assert_eq!(s.count(), 0);
        assert_eq!(s.quantile(0.5), None);
    }

    #[test]
    fn test_single_value_is_exact() {
        let mut s = sketch();
        s.insert(42.0);
        assert_eq!(s.quantile(0.0), Some(42.0));
        assert_eq!(s.quantile(0.5), Some(42.0));
        assert_eq!(s.quantile(0.99), Some(42.0));
    }

    #[test]
    fn test_p99_within_relative_error() {
        let mut s = sketch();
        for v in 1..=10_000 {
            s.insert(f64::from(v));
        }

        // Exact linear-interpolated p99 of 1..=10000 is 9900.01.
        let p99 = s.quantile(0.99).unwrap();
        assert!(relative_error(p99, 9_900.01) <= 0.01 + 1e-9, "p99={p99}");

        let p50 = s.quantile(0.5).unwrap();
        assert!(relative_error(p50, 5_000.5) <= 0.01 + 1e-9, "p50={p50}");

        let p90 = s.quantile(0.9).unwrap();
        assert!(relative_error(p90, 9_000.1) <= 0.01 + 1e-9, "p90={p90}");
    }

    #[test]
    fn test_bins_bounded_for_many_distinct_values() {
        let mut s = sketch();
        for v in 1..=100_000 {
            s.insert(f64::from(v) * 1.37);
        }
        // 1 % bins over five decades need far fewer than 2048 slots.
        assert!(s.bins() < 700, "bins={}", s.bins());
        assert_eq!(s.count(), 100_000);
    }

    #[test]
    fn test_collapse_respects_max_bins() {
        let mut s = QuantileSketch::new(&SketchConfig {
            relative_accuracy: 0.01,
            max_bins: 16,
        });
        for exp in 0..200 {
            s.insert(1.1f64.powi(exp));
        }
        assert!(s.bins() <= 16);

        // The largest values keep their accuracy.
        let top = s.quantile(1.0).unwrap();
        assert!(relative_error(top, 1.1f64.powi(199)) <= 0.01 + 1e-9);
        let (v197, v198) = (1.1f64.powi(197), 1.1f64.powi(198));
        let p99 = s.quantile(0.99).unwrap();
        assert!(relative_error(p99, v197 + (v198 - v197) * 0.01) <= 0.01 + 1e-9);
    }

    #[test]
    fn test_negative_zero_and_positive_values() {
        let mut s = sketch();
        for v in [-100.0, -10.0, 0.0, 0.0, 10.0, 100.0] {
            s.insert(v);
        }
        let lowest = s.quantile(0.0).unwrap();
        assert!(relative_error(lowest, -100.0) <= 0.01 + 1e-9, "p0={lowest}");
        let highest = s.quantile(1.0).unwrap();
        assert!(relative_error(highest, 100.0) <= 0.01 + 1e-9, "p100={highest}");

        let p20 = s.quantile(0.2).unwrap();
        // Rank 0.2 * 5 = 1.0 lands exactly on -10.
        assert!(relative_error(p20, -10.0) <= 0.01 + 1e-9, "p20={p20}");

        assert_eq!(s.quantile(0.5), Some(0.0));
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let mut s = sketch();
        s.insert(f64::NAN);
        s.insert(f64::INFINITY);
        s.insert(3.0);
        assert_eq!(s.count(), 1);
        assert_eq!(s.quantile(0.5), Some(3.0));
    }
}
