//! Rolling-window aggregation primitives.
//!
//! Every windowed aggregator keeps a fixed ring of time buckets, each holding
//! a partial reduction, and folds the live buckets on read. None of these
//! types lock internally; one metric has exactly one writer.

mod aggregators;
mod counter;
pub mod sketch;
mod window;

pub use aggregators::{
    ExtremumAggregator, IdentityAggregator, MeanAggregator, NullAggregator, QuantileAggregator,
    StdDevAggregator, SumAggregator,
};
pub use counter::SlidingWindowCounter;

use qwatch_common::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricValue;

/// Reduces a stream of `(value, timestamp)` pairs over a rolling window.
pub trait Aggregator: Send {
    /// Folds one sample in and returns the current aggregate.
    fn update(&mut self, value: f64, timestamp: Timestamp) -> f64;

    /// Moves the clock forward without a sample, evicting stale buckets.
    fn advance(&mut self, timestamp: Timestamp);

    fn value(&self) -> f64;

    /// Number of samples still inside the window.
    fn count(&self) -> u64;

    fn snapshot(&self) -> MetricValue {
        MetricValue::Scalar(self.value())
    }

    fn reset(&mut self);
}

fn default_window_ms() -> i64 {
    60_000
}

fn default_granularity_ms() -> i64 {
    5_000
}

fn default_quantile() -> f64 {
    0.5
}

fn default_alpha() -> f64 {
    sketch::DEFAULT_ALPHA
}

/// Declarative aggregator selection, as found in configuration files.
///
/// ```
/// use qwatch_alert::aggregation::AggregatorConfig;
///
/// let cfg: AggregatorConfig = serde_json::from_str(
///     r#"{"type":"quantile","window_ms":60000,"granularity_ms":5000,"quantile":0.95}"#,
/// ).unwrap();
/// let mut agg = cfg.build();
/// agg.update(10.0, 0);
/// assert_eq!(agg.count(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatorConfig {
    Sum {
        #[serde(default = "default_window_ms")]
        window_ms: i64,
        #[serde(default = "default_granularity_ms")]
        granularity_ms: i64,
    },
    Mean {
        #[serde(default = "default_window_ms")]
        window_ms: i64,
        #[serde(default = "default_granularity_ms")]
        granularity_ms: i64,
    },
    StdDev {
        #[serde(default = "default_window_ms")]
        window_ms: i64,
        #[serde(default = "default_granularity_ms")]
        granularity_ms: i64,
    },
    Max {
        #[serde(default = "default_window_ms")]
        window_ms: i64,
        #[serde(default = "default_granularity_ms")]
        granularity_ms: i64,
    },
    Min {
        #[serde(default = "default_window_ms")]
        window_ms: i64,
        #[serde(default = "default_granularity_ms")]
        granularity_ms: i64,
    },
    Quantile {
        #[serde(default = "default_window_ms")]
        window_ms: i64,
        #[serde(default = "default_granularity_ms")]
        granularity_ms: i64,
        #[serde(default = "default_quantile")]
        quantile: f64,
        #[serde(default = "default_alpha")]
        alpha: f64,
        #[serde(default)]
        emit_sketch: bool,
    },
    #[default]
    Identity,
    Null,
}

impl AggregatorConfig {
    pub fn build(&self) -> Box<dyn Aggregator> {
        match *self {
            AggregatorConfig::Sum {
                window_ms,
                granularity_ms,
            } => Box::new(SumAggregator::new(window_ms, granularity_ms)),
            AggregatorConfig::Mean {
                window_ms,
                granularity_ms,
            } => Box::new(MeanAggregator::new(window_ms, granularity_ms)),
            AggregatorConfig::StdDev {
                window_ms,
                granularity_ms,
            } => Box::new(StdDevAggregator::new(window_ms, granularity_ms)),
            AggregatorConfig::Max {
                window_ms,
                granularity_ms,
            } => Box::new(ExtremumAggregator::max(window_ms, granularity_ms)),
            AggregatorConfig::Min {
                window_ms,
                granularity_ms,
            } => Box::new(ExtremumAggregator::min(window_ms, granularity_ms)),
            AggregatorConfig::Quantile {
                window_ms,
                granularity_ms,
                quantile,
                alpha,
                emit_sketch,
            } => Box::new(
                QuantileAggregator::new(window_ms, granularity_ms, quantile, alpha)
                    .emitting_sketch(emit_sketch),
            ),
            AggregatorConfig::Identity => Box::new(IdentityAggregator::default()),
            AggregatorConfig::Null => Box::new(NullAggregator),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AggregatorConfig::Sum { .. } => "sum",
            AggregatorConfig::Mean { .. } => "mean",
            AggregatorConfig::StdDev { .. } => "std_dev",
            AggregatorConfig::Max { .. } => "max",
            AggregatorConfig::Min { .. } => "min",
            AggregatorConfig::Quantile { .. } => "quantile",
            AggregatorConfig::Identity => "identity",
            AggregatorConfig::Null => "null",
        }
    }
}
