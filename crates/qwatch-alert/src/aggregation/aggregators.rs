use qwatch_common::types::Timestamp;

use super::sketch::{LogSketch, QuantileSketch};
use super::window::BucketRing;
use super::Aggregator;
use crate::metrics::MetricValue;

#[derive(Debug, Clone, Copy, Default)]
struct SumBucket {
    sum: f64,
    count: u64,
}

/// Running sum over the window.
pub struct SumAggregator {
    ring: BucketRing<SumBucket>,
}

impl SumAggregator {
    pub fn new(window_ms: i64, granularity_ms: i64) -> Self {
        Self {
            ring: BucketRing::new(window_ms, granularity_ms, SumBucket::default()),
        }
    }

    fn totals(&self) -> SumBucket {
        self.ring.live().fold(SumBucket::default(), |acc, b| SumBucket {
            sum: acc.sum + b.sum,
            count: acc.count + b.count,
        })
    }
}

impl Aggregator for SumAggregator {
    fn update(&mut self, value: f64, timestamp: Timestamp) -> f64 {
        if let Some(bucket) = self.ring.bucket_mut(timestamp) {
            bucket.sum += value;
            bucket.count += 1;
        }
        self.value()
    }

    fn advance(&mut self, timestamp: Timestamp) {
        self.ring.advance(timestamp);
    }

    fn value(&self) -> f64 {
        self.totals().sum
    }

    fn count(&self) -> u64 {
        self.totals().count
    }

    fn reset(&mut self) {
        self.ring.clear();
    }
}

/// Arithmetic mean over the window.
pub struct MeanAggregator {
    inner: SumAggregator,
}

impl MeanAggregator {
    pub fn new(window_ms: i64, granularity_ms: i64) -> Self {
        Self {
            inner: SumAggregator::new(window_ms, granularity_ms),
        }
    }
}

impl Aggregator for MeanAggregator {
    fn update(&mut self, value: f64, timestamp: Timestamp) -> f64 {
        self.inner.update(value, timestamp);
        self.value()
    }

    fn advance(&mut self, timestamp: Timestamp) {
        self.inner.advance(timestamp);
    }

    fn value(&self) -> f64 {
        let totals = self.inner.totals();
        if totals.count == 0 {
            0.0
        } else {
            totals.sum / totals.count as f64
        }
    }

    fn count(&self) -> u64 {
        self.inner.count()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Welford accumulator for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Chan et al. parallel combination.
    fn merge(self, other: Welford) -> Welford {
        if self.count == 0 {
            return other;
        }
        if other.count == 0 {
            return self;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * other.count as f64 / count as f64;
        let m2 = self.m2
            + other.m2
            + delta * delta * self.count as f64 * other.count as f64 / count as f64;
        Welford { count, mean, m2 }
    }

    fn population_std_dev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0).sqrt()
        }
    }
}

/// Population standard deviation over the window.
pub struct StdDevAggregator {
    ring: BucketRing<Welford>,
}

impl StdDevAggregator {
    pub fn new(window_ms: i64, granularity_ms: i64) -> Self {
        Self {
            ring: BucketRing::new(window_ms, granularity_ms, Welford::default()),
        }
    }

    fn combined(&self) -> Welford {
        self.ring
            .live()
            .fold(Welford::default(), |acc, b| acc.merge(*b))
    }
}

impl Aggregator for StdDevAggregator {
    fn update(&mut self, value: f64, timestamp: Timestamp) -> f64 {
        if let Some(bucket) = self.ring.bucket_mut(timestamp) {
            bucket.push(value);
        }
        self.value()
    }

    fn advance(&mut self, timestamp: Timestamp) {
        self.ring.advance(timestamp);
    }

    fn value(&self) -> f64 {
        self.combined().population_std_dev()
    }

    fn count(&self) -> u64 {
        self.combined().count
    }

    fn reset(&mut self) {
        self.ring.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extremum {
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, Default)]
struct ExtremumBucket {
    value: Option<f64>,
    count: u64,
}

/// Largest (or smallest) value over the window.
pub struct ExtremumAggregator {
    kind: Extremum,
    ring: BucketRing<ExtremumBucket>,
}

impl ExtremumAggregator {
    pub fn max(window_ms: i64, granularity_ms: i64) -> Self {
        Self::new(Extremum::Max, window_ms, granularity_ms)
    }

    pub fn min(window_ms: i64, granularity_ms: i64) -> Self {
        Self::new(Extremum::Min, window_ms, granularity_ms)
    }

    fn new(kind: Extremum, window_ms: i64, granularity_ms: i64) -> Self {
        Self {
            kind,
            ring: BucketRing::new(window_ms, granularity_ms, ExtremumBucket::default()),
        }
    }

    fn pick(&self, a: f64, b: f64) -> f64 {
        match self.kind {
            Extremum::Max => a.max(b),
            Extremum::Min => a.min(b),
        }
    }
}

impl Aggregator for ExtremumAggregator {
    fn update(&mut self, value: f64, timestamp: Timestamp) -> f64 {
        let kind = self.kind;
        if let Some(bucket) = self.ring.bucket_mut(timestamp) {
            bucket.value = Some(match (bucket.value, kind) {
                (None, _) => value,
                (Some(v), Extremum::Max) => v.max(value),
                (Some(v), Extremum::Min) => v.min(value),
            });
            bucket.count += 1;
        }
        self.value()
    }

    fn advance(&mut self, timestamp: Timestamp) {
        self.ring.advance(timestamp);
    }

    fn value(&self) -> f64 {
        self.ring
            .live()
            .filter_map(|b| b.value)
            .reduce(|a, b| self.pick(a, b))
            .unwrap_or(0.0)
    }

    fn count(&self) -> u64 {
        self.ring.live().map(|b| b.count).sum()
    }

    fn reset(&mut self) {
        self.ring.clear();
    }
}

/// Quantile estimate over the window, backed by one [`LogSketch`] per
/// bucket.
pub struct QuantileAggregator {
    quantile: f64,
    emit_sketch: bool,
    ring: BucketRing<LogSketch>,
}

impl QuantileAggregator {
    pub fn new(window_ms: i64, granularity_ms: i64, quantile: f64, alpha: f64) -> Self {
        Self {
            quantile: quantile.clamp(0.0, 1.0),
            emit_sketch: false,
            ring: BucketRing::new(window_ms, granularity_ms, LogSketch::new(alpha)),
        }
    }

    /// Snapshots carry the merged sketch instead of the configured quantile.
    pub fn emitting_sketch(mut self, emit: bool) -> Self {
        self.emit_sketch = emit;
        self
    }

    /// All live buckets merged into one sketch.
    pub fn merged(&self) -> LogSketch {
        let mut iter = self.ring.live();
        let mut merged = match iter.next() {
            Some(first) => first.clone(),
            None => return LogSketch::default(),
        };
        for sketch in iter {
            merged.merge(sketch);
        }
        merged
    }

    pub fn value_at_quantile(&self, q: f64) -> f64 {
        self.merged().value_at_quantile(q)
    }
}

impl Aggregator for QuantileAggregator {
    fn update(&mut self, value: f64, timestamp: Timestamp) -> f64 {
        if let Some(bucket) = self.ring.bucket_mut(timestamp) {
            bucket.accept(value);
        }
        self.value()
    }

    fn advance(&mut self, timestamp: Timestamp) {
        self.ring.advance(timestamp);
    }

    fn value(&self) -> f64 {
        self.value_at_quantile(self.quantile)
    }

    fn count(&self) -> u64 {
        self.ring.live().map(|s| s.count()).sum()
    }

    fn snapshot(&self) -> MetricValue {
        if self.emit_sketch {
            MetricValue::Sketch(self.merged())
        } else {
            MetricValue::Scalar(self.value())
        }
    }

    fn reset(&mut self) {
        self.ring.clear();
    }
}

/// Reports the most recent sample; keeps no window.
#[derive(Default)]
pub struct IdentityAggregator {
    last: Option<(Timestamp, f64)>,
    count: u64,
}

impl Aggregator for IdentityAggregator {
    fn update(&mut self, value: f64, timestamp: Timestamp) -> f64 {
        // An out-of-order sample is counted but does not replace a newer one.
        if !matches!(self.last, Some((ts, _)) if ts > timestamp) {
            self.last = Some((timestamp, value));
        }
        self.count += 1;
        self.value()
    }

    fn advance(&mut self, _timestamp: Timestamp) {}

    fn value(&self) -> f64 {
        self.last.map(|(_, v)| v).unwrap_or(0.0)
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.last = None;
        self.count = 0;
    }
}

/// Discards every sample.
#[derive(Default)]
pub struct NullAggregator;

impl Aggregator for NullAggregator {
    fn update(&mut self, _value: f64, _timestamp: Timestamp) -> f64 {
        0.0
    }

    fn advance(&mut self, _timestamp: Timestamp) {}

    fn value(&self) -> f64 {
        0.0
    }

    fn count(&self) -> u64 {
        0
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_returns_running_total_within_window() {
        let mut agg = SumAggregator::new(10_000, 1000);
        let values = [3.0, 1.5, 4.0, 1.0, 5.5, 9.0];
        let mut expected = 0.0;
        for (i, v) in values.iter().enumerate() {
            expected += v;
            assert_eq!(agg.update(*v, i as i64 * 700), expected);
        }
        assert_eq!(agg.count(), values.len() as u64);
    }

    #[test]
    fn sum_evicts_old_buckets() {
        let mut agg = SumAggregator::new(3000, 1000);
        agg.update(1.0, 0);
        agg.update(2.0, 1000);
        agg.update(4.0, 2000);
        assert_eq!(agg.update(8.0, 3000), 14.0);
        assert_eq!(agg.count(), 3);
        agg.advance(10_000);
        assert_eq!(agg.value(), 0.0);
        assert_eq!(agg.count(), 0);
    }

    #[test]
    fn samples_older_than_window_are_dropped() {
        let mut agg = SumAggregator::new(2000, 1000);
        agg.update(1.0, 5000);
        assert_eq!(agg.update(100.0, 1000), 1.0);
        assert_eq!(agg.count(), 1);
    }

    #[test]
    fn mean_tracks_window() {
        let mut agg = MeanAggregator::new(2000, 1000);
        agg.update(2.0, 0);
        agg.update(4.0, 500);
        assert_eq!(agg.value(), 3.0);
        assert_eq!(agg.update(10.0, 2000), 10.0);
    }

    #[test]
    fn std_dev_merges_buckets() {
        let mut agg = StdDevAggregator::new(10_000, 1000);
        for (i, v) in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].iter().enumerate() {
            agg.update(*v, i as i64 * 1000);
        }
        assert!((agg.value() - 2.0).abs() < 1e-12);
        assert_eq!(agg.count(), 8);
    }

    #[test]
    fn std_dev_after_eviction_matches_survivors() {
        let mut agg = StdDevAggregator::new(2000, 1000);
        agg.update(100.0, 0);
        agg.update(1.0, 1000);
        agg.update(3.0, 2000);
        assert!((agg.value() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn max_and_min() {
        let mut max = ExtremumAggregator::max(3000, 1000);
        let mut min = ExtremumAggregator::min(3000, 1000);
        for (ts, v) in [(0, 5.0), (1000, 9.0), (2000, -1.0), (3000, 2.0)] {
            max.update(v, ts);
            min.update(v, ts);
        }
        assert_eq!(max.value(), 9.0);
        assert_eq!(min.value(), -1.0);
        max.advance(4000);
        assert_eq!(max.value(), 2.0);
    }

    #[test]
    fn quantile_merges_bucket_sketches() {
        let mut agg = QuantileAggregator::new(100_000, 10_000, 0.5, 0.01);
        for v in 1..=100 {
            agg.update(v as f64, v * 500);
        }
        let p50 = agg.value();
        assert!((p50 - 50.0).abs() <= 2.0, "p50={p50}");
        assert_eq!(agg.count(), 100);
        assert!(matches!(agg.snapshot(), MetricValue::Scalar(_)));
        let agg = agg.emitting_sketch(true);
        assert!(matches!(agg.snapshot(), MetricValue::Sketch(s) if s.count() == 100));
    }

    #[test]
    fn identity_keeps_latest() {
        let mut agg = IdentityAggregator::default();
        agg.update(1.0, 10);
        agg.update(2.0, 5);
        assert_eq!(agg.value(), 1.0);
        agg.update(3.0, 20);
        assert_eq!(agg.value(), 3.0);
        assert_eq!(agg.count(), 3);
    }

    #[test]
    fn null_is_always_zero() {
        let mut agg = NullAggregator;
        assert_eq!(agg.update(42.0, 0), 0.0);
        assert_eq!(agg.count(), 0);
    }
}
