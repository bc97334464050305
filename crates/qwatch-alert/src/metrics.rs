//! Registered metrics: one aggregator per metric id, fed by raw samples and
//! read back as periodic snapshots.

use std::collections::HashMap;

use qwatch_common::types::{MetricSample, Timestamp};
use serde::{Deserialize, Serialize};

use crate::aggregation::sketch::{LogSketch, QuantileSketch};
use crate::aggregation::{Aggregator, AggregatorConfig};

/// A metric's current value: a plain number or a full distribution.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f64),
    Sketch(LogSketch),
}

impl MetricValue {
    /// Collapses the value to a number with `reduction` (ignored for scalars).
    pub fn reduce(&self, reduction: SketchReduction) -> f64 {
        match self {
            MetricValue::Scalar(v) => *v,
            MetricValue::Sketch(sketch) => reduction.apply(sketch),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Scalar(value)
    }
}

/// How a sketch input is reduced before a threshold comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SketchReduction {
    #[default]
    Sum,
    Avg,
    Min,
    Max,
    Count,
    P50,
    P90,
    P95,
    P99,
}

impl SketchReduction {
    pub fn apply<S: QuantileSketch>(&self, sketch: &S) -> f64 {
        match self {
            SketchReduction::Sum => sketch.sum(),
            SketchReduction::Avg => sketch.mean(),
            SketchReduction::Min => sketch.min(),
            SketchReduction::Max => sketch.max(),
            SketchReduction::Count => sketch.count() as f64,
            SketchReduction::P50 => sketch.value_at_quantile(0.5),
            SketchReduction::P90 => sketch.value_at_quantile(0.9),
            SketchReduction::P95 => sketch.value_at_quantile(0.95),
            SketchReduction::P99 => sketch.value_at_quantile(0.99),
        }
    }
}

/// Values of every registered metric at one instant.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    pub timestamp: Timestamp,
    pub values: HashMap<String, MetricValue>,
}

impl MetricSnapshot {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            values: HashMap::new(),
        }
    }

    pub fn with(mut self, metric_id: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.values.insert(metric_id.into(), value.into());
        self
    }
}

struct RegisteredMetric {
    config: AggregatorConfig,
    aggregator: Box<dyn Aggregator>,
}

/// Aggregators keyed by metric id.
#[derive(Default)]
pub struct MetricRegistry {
    metrics: HashMap<String, RegisteredMetric>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the aggregator of `metric_id`. Replacing
    /// with an identical config keeps the accumulated state.
    pub fn register(&mut self, metric_id: &str, config: AggregatorConfig) {
        if let Some(existing) = self.metrics.get(metric_id) {
            if existing.config == config {
                return;
            }
        }
        let aggregator = config.build();
        self.metrics.insert(
            metric_id.to_string(),
            RegisteredMetric { config, aggregator },
        );
    }

    pub fn unregister(&mut self, metric_id: &str) -> bool {
        self.metrics.remove(metric_id).is_some()
    }

    pub fn contains(&self, metric_id: &str) -> bool {
        self.metrics.contains_key(metric_id)
    }

    pub fn config(&self, metric_id: &str) -> Option<&AggregatorConfig> {
        self.metrics.get(metric_id).map(|m| &m.config)
    }

    /// Folds a sample into its metric's aggregator. Returns the new
    /// aggregate, or `None` for an unregistered metric.
    pub fn ingest(&mut self, sample: &MetricSample) -> Option<f64> {
        let metric = self.metrics.get_mut(&sample.metric_id)?;
        Some(metric.aggregator.update(sample.value, sample.timestamp))
    }

    /// Advances every aggregator to `ts` and reads its current value.
    pub fn snapshot(&mut self, ts: Timestamp) -> MetricSnapshot {
        let mut snapshot = MetricSnapshot::new(ts);
        for (id, metric) in &mut self.metrics {
            metric.aggregator.advance(ts);
            snapshot
                .values
                .insert(id.clone(), metric.aggregator.snapshot());
        }
        snapshot
    }

    pub fn metric_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.metrics.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
