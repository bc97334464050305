use std::collections::BTreeMap;

use qwatch_common::types::Timestamp;
use serde::{Deserialize, Serialize};

use super::threshold::{CompareOp, ThresholdCondition};
use super::{ErrorLevel, EvaluationResult, RuleEvaluationState};
use crate::metrics::{MetricValue, SketchReduction};

/// Number of updates between buffer trims.
pub const TRIM_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    /// `current - previous`
    #[default]
    Value,
    /// `(current - previous) / |previous| * 100`; slots where the previous
    /// value is zero are skipped.
    Percentage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAggregation {
    #[default]
    Avg,
    Min,
    Max,
    Sum,
    P90,
    P95,
    P99,
}

impl ChangeAggregation {
    /// Reduces a non-empty set of deltas. Percentiles use nearest rank.
    pub fn apply(&self, deltas: &[f64]) -> f64 {
        if deltas.is_empty() {
            return 0.0;
        }
        match self {
            ChangeAggregation::Avg => deltas.iter().sum::<f64>() / deltas.len() as f64,
            ChangeAggregation::Min => deltas.iter().copied().fold(f64::INFINITY, f64::min),
            ChangeAggregation::Max => deltas.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ChangeAggregation::Sum => deltas.iter().sum(),
            ChangeAggregation::P90 => percentile(deltas, 0.90),
            ChangeAggregation::P95 => percentile(deltas, 0.95),
            ChangeAggregation::P99 => percentile(deltas, 0.99),
        }
    }
}

fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeCondition {
    /// Length (ms) of each compared window.
    pub window_size: i64,
    /// Gap (ms) between the end of the previous window and the start of the
    /// current one.
    #[serde(default)]
    pub time_shift: i64,
    /// Resolution (ms) of the buffer. `window_size` must be a multiple.
    pub sample_interval: i64,
    #[serde(default)]
    pub change_type: ChangeType,
    #[serde(default)]
    pub aggregation: ChangeAggregation,
    pub operator: CompareOp,
    pub error_threshold: f64,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub reduction: SketchReduction,
}

impl ChangeCondition {
    fn threshold(&self) -> ThresholdCondition {
        ThresholdCondition {
            operator: self.operator,
            error_threshold: self.error_threshold,
            warning_threshold: self.warning_threshold,
            unit: self.unit.clone(),
            reduction: self.reduction,
        }
    }

    fn slots(&self) -> usize {
        (self.window_size / self.sample_interval.max(1)).max(1) as usize
    }
}

/// Compares the current window of a metric against an earlier one.
pub struct ChangeEvaluator {
    condition: ChangeCondition,
    threshold: ThresholdCondition,
    buffer: BTreeMap<Timestamp, f64>,
    updates: u64,
}

impl ChangeEvaluator {
    pub fn new(condition: ChangeCondition) -> Self {
        let threshold = condition.threshold();
        Self {
            condition,
            threshold,
            buffer: BTreeMap::new(),
            updates: 0,
        }
    }

    fn interval(&self) -> i64 {
        self.condition.sample_interval.max(1)
    }

    pub fn align(&self, ts: Timestamp) -> Timestamp {
        ts - ts.rem_euclid(self.interval())
    }

    /// Records `value` in the slot covering `ts` (the latest value wins) and
    /// trims the buffer every [`TRIM_INTERVAL`] updates once a full
    /// comparison is possible.
    pub fn update(&mut self, ts: Timestamp, value: f64) {
        self.buffer.insert(self.align(ts), value);
        self.updates += 1;
        if self.updates % TRIM_INTERVAL == 0 && self.is_full_window(ts) {
            self.trim(ts);
        }
    }

    pub fn current_window_start(&self, now: Timestamp) -> Timestamp {
        self.align(now - self.condition.window_size)
    }

    pub fn previous_window_start(&self, now: Timestamp) -> Timestamp {
        self.current_window_start(now) - self.condition.time_shift - self.condition.window_size
    }

    fn window_from(&self, start: Timestamp) -> Vec<Option<f64>> {
        let interval = self.interval();
        (0..self.condition.slots() as i64)
            .map(|i| self.buffer.get(&(start + (i + 1) * interval)).copied())
            .collect()
    }

    /// Slot values of `(current_window_start, current_window_start + window_size]`.
    pub fn current_window(&self, now: Timestamp) -> Vec<Option<f64>> {
        self.window_from(self.current_window_start(now))
    }

    /// Slot values of the previous window, index-aligned with
    /// [`current_window`](Self::current_window).
    pub fn previous_window(&self, now: Timestamp) -> Vec<Option<f64>> {
        self.window_from(self.previous_window_start(now))
    }

    /// True once the buffer reaches back to the first previous-window slot.
    pub fn is_full_window(&self, now: Timestamp) -> bool {
        let first_slot = self.previous_window_start(now) + self.interval();
        self.buffer
            .keys()
            .next()
            .is_some_and(|&oldest| oldest <= first_slot)
    }

    /// Drops slots at or before the previous window's start.
    pub fn trim(&mut self, now: Timestamp) {
        let keep_from = self.previous_window_start(now) + 1;
        self.buffer = self.buffer.split_off(&keep_from);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Per-slot deltas where both windows hold a value.
    pub fn deltas(&self, now: Timestamp) -> Vec<f64> {
        let current = self.current_window(now);
        let previous = self.previous_window(now);
        current
            .iter()
            .zip(previous.iter())
            .filter_map(|pair| match pair {
                (Some(cur), Some(prev)) => match self.condition.change_type {
                    ChangeType::Value => Some(cur - prev),
                    ChangeType::Percentage if *prev == 0.0 => None,
                    ChangeType::Percentage => Some((cur - prev) / prev.abs() * 100.0),
                },
                _ => None,
            })
            .collect()
    }

    pub fn evaluate(&mut self, ts: Timestamp, value: &MetricValue) -> EvaluationResult {
        self.update(ts, value.reduce(self.condition.reduction));

        let deltas = self.deltas(ts);
        let (change, level) = if deltas.is_empty() {
            (0.0, ErrorLevel::None)
        } else {
            let change = self.condition.aggregation.apply(&deltas);
            (change, self.threshold.level(change))
        };

        EvaluationResult::new(
            change,
            level,
            RuleEvaluationState::Change {
                comparator: self.condition.operator,
                error_threshold: self.condition.error_threshold,
                warning_threshold: self.condition.warning_threshold,
                value: change,
                unit: self.condition.unit.clone(),
                window_size: self.condition.window_size,
                time_shift: self.condition.time_shift,
                change_type: self.condition.change_type,
                aggregation: self.condition.aggregation,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(change_type: ChangeType, aggregation: ChangeAggregation) -> ChangeCondition {
        ChangeCondition {
            window_size: 3000,
            time_shift: 0,
            sample_interval: 1000,
            change_type,
            aggregation,
            operator: CompareOp::Gt,
            error_threshold: 50.0,
            warning_threshold: Some(10.0),
            unit: None,
            reduction: SketchReduction::default(),
        }
    }

    #[test]
    fn window_boundaries() {
        let eval = ChangeEvaluator::new(condition(ChangeType::Value, ChangeAggregation::Avg));
        assert_eq!(eval.current_window_start(10_500), 7000);
        assert_eq!(eval.previous_window_start(10_500), 4000);

        let mut shifted = condition(ChangeType::Value, ChangeAggregation::Avg);
        shifted.time_shift = 2000;
        let eval = ChangeEvaluator::new(shifted);
        assert_eq!(eval.previous_window_start(10_000), 2000);
    }

    #[test]
    fn value_change_between_windows() {
        let mut eval = ChangeEvaluator::new(condition(ChangeType::Value, ChangeAggregation::Avg));
        for (ts, v) in [(1000, 10.0), (2000, 20.0), (3000, 30.0)] {
            eval.update(ts, v);
        }
        for (ts, v) in [(4000, 15.0), (5000, 25.0)] {
            eval.update(ts, v);
        }
        let result = eval.evaluate(6000, &MetricValue::Scalar(100.0));
        assert_eq!(eval.previous_window(6000), vec![Some(10.0), Some(20.0), Some(30.0)]);
        assert_eq!(eval.current_window(6000), vec![Some(15.0), Some(25.0), Some(100.0)]);
        // deltas: 5, 5, 70
        assert!((result.value - 80.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.error_level, ErrorLevel::Warning);
    }

    #[test]
    fn percentage_change_skips_zero_baseline() {
        let mut eval =
            ChangeEvaluator::new(condition(ChangeType::Percentage, ChangeAggregation::Max));
        for (ts, v) in [(1000, 0.0), (2000, 10.0), (3000, 20.0), (4000, 5.0), (5000, 30.0)] {
            eval.update(ts, v);
        }
        let result = eval.evaluate(6000, &MetricValue::Scalar(20.0));
        // slot 0 skipped, then +200%, 0%
        assert_eq!(result.value, 200.0);
        assert_eq!(result.error_level, ErrorLevel::Critical);
        assert!(result.triggered);
    }

    #[test]
    fn no_overlap_yields_zero() {
        let mut eval = ChangeEvaluator::new(condition(ChangeType::Value, ChangeAggregation::Sum));
        let result = eval.evaluate(6000, &MetricValue::Scalar(1.0));
        assert_eq!(result.value, 0.0);
        assert_eq!(result.error_level, ErrorLevel::None);
    }

    #[test]
    fn aggregations() {
        let deltas = [1.0, -4.0, 3.0, 10.0];
        assert_eq!(ChangeAggregation::Avg.apply(&deltas), 2.5);
        assert_eq!(ChangeAggregation::Min.apply(&deltas), -4.0);
        assert_eq!(ChangeAggregation::Max.apply(&deltas), 10.0);
        assert_eq!(ChangeAggregation::Sum.apply(&deltas), 10.0);
        assert_eq!(ChangeAggregation::P90.apply(&deltas), 10.0);
        let many: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(ChangeAggregation::P95.apply(&many), 95.0);
        assert_eq!(ChangeAggregation::P99.apply(&many), 99.0);
    }

    #[test]
    fn trimming_keeps_previous_window() {
        let mut eval = ChangeEvaluator::new(condition(ChangeType::Value, ChangeAggregation::Avg));
        for i in 0..(TRIM_INTERVAL as i64) {
            eval.update(i * 1000, i as f64);
        }
        let now = (TRIM_INTERVAL as i64 - 1) * 1000;
        // previous window starts at now - 6000; slots after it survive.
        assert_eq!(eval.buffered(), 6);
        assert!(eval.previous_window(now).iter().all(Option::is_some));
        assert!(eval.current_window(now).iter().all(Option::is_some));
    }
}
