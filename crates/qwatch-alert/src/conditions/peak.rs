use qwatch_common::types::Timestamp;
use serde::{Deserialize, Serialize};

use super::{ErrorLevel, EvaluationContext, EvaluationResult, RuleEvaluationState};
use crate::history::MetricHistory;
use crate::metrics::{MetricValue, SketchReduction};
use crate::stats::PeakDetector;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeakDirection {
    Above,
    Below,
    #[default]
    Both,
}

impl PeakDirection {
    pub fn accepts(&self, signal: i8) -> bool {
        match self {
            PeakDirection::Above => signal > 0,
            PeakDirection::Below => signal < 0,
            PeakDirection::Both => signal != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakCondition {
    /// Samples in the detector's baseline window.
    pub lag: usize,
    /// Z-score beyond which a sample is an error-level peak.
    pub deviations: f64,
    /// Lower z-score for warning-level peaks.
    #[serde(default)]
    pub warning_deviations: Option<f64>,
    #[serde(default)]
    pub influence: f64,
    /// Span (ms) of recent samples inspected each tick.
    pub window_size: i64,
    #[serde(default)]
    pub direction: PeakDirection,
    /// Signals closer than this (ms) to the previously counted one are ignored.
    #[serde(default)]
    pub trigger_window: Option<i64>,
    /// When set, triggers only once this fraction of inspected samples signal.
    #[serde(default)]
    pub threshold_fraction: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PeakCount {
    count: usize,
    total: usize,
    last_signal: i8,
}

pub struct PeakEvaluator {
    condition: PeakCondition,
}

impl PeakEvaluator {
    pub fn new(condition: PeakCondition) -> Self {
        Self { condition }
    }

    pub fn condition(&self) -> &PeakCondition {
        &self.condition
    }

    /// `lag` samples at or before `ts - window_size`, followed by every
    /// sample in `(ts - window_size, ts]`.
    pub fn lookback(
        &self,
        history: &MetricHistory,
        metric_id: &str,
        ts: Timestamp,
    ) -> Vec<(Timestamp, f64)> {
        let start = ts - self.condition.window_size;
        let mut samples = history.preceding(metric_id, start, self.condition.lag);
        samples.extend(history.range(metric_id, start, ts));
        samples
    }

    /// Raw error-detector signals for every lookback sample, lag period
    /// included (as zeros).
    pub fn signals(&self, history: &MetricHistory, metric_id: &str, ts: Timestamp) -> Vec<i8> {
        let mut detector = self.detector(self.condition.deviations);
        self.lookback(history, metric_id, ts)
            .into_iter()
            .map(|(t, v)| detector.update(v, t))
            .collect()
    }

    fn detector(&self, deviations: f64) -> PeakDetector {
        PeakDetector::new(self.condition.lag, deviations, self.condition.influence)
    }

    fn count(&self, samples: &[(Timestamp, f64)], deviations: f64) -> PeakCount {
        let mut detector = self.detector(deviations);
        let mut result = PeakCount::default();
        let mut last_counted: Option<Timestamp> = None;

        for &(ts, value) in samples {
            let in_lag = detector.is_in_lag_period();
            let signal = detector.update(value, ts);
            if in_lag {
                continue;
            }
            result.total += 1;
            if !self.condition.direction.accepts(signal) {
                continue;
            }
            if let (Some(window), Some(last)) = (self.condition.trigger_window, last_counted) {
                if ts - last < window {
                    continue;
                }
            }
            last_counted = Some(ts);
            result.count += 1;
            result.last_signal = signal;
        }
        result
    }

    fn is_triggered(&self, peaks: &PeakCount) -> bool {
        match self.condition.threshold_fraction {
            Some(fraction) => {
                peaks.total > 0 && peaks.count as f64 / peaks.total as f64 >= fraction
            }
            None => peaks.count > 0,
        }
    }

    pub fn evaluate(
        &self,
        ctx: &EvaluationContext<'_>,
        ts: Timestamp,
        value: &MetricValue,
    ) -> EvaluationResult {
        let samples = self.lookback(ctx.history, ctx.metric_id, ts);
        let current = samples
            .last()
            .map(|&(_, v)| v)
            .unwrap_or_else(|| value.reduce(SketchReduction::default()));

        let error = self.count(&samples, self.condition.deviations);
        let (level, peaks) = if self.is_triggered(&error) {
            (ErrorLevel::Critical, error)
        } else {
            match self.condition.warning_deviations {
                Some(deviations) => {
                    let warning = self.count(&samples, deviations);
                    if self.is_triggered(&warning) {
                        (ErrorLevel::Warning, warning)
                    } else {
                        (ErrorLevel::None, error)
                    }
                }
                None => (ErrorLevel::None, error),
            }
        };

        EvaluationResult::new(
            current,
            level,
            RuleEvaluationState::Peak {
                signal: peaks.last_signal,
                direction: self.condition.direction,
                deviations: self.condition.deviations,
                warning_deviations: self.condition.warning_deviations,
                influence: self.condition.influence,
                lag: self.condition.lag,
                value: current,
                trigger_count: peaks.count,
                total: peaks.total,
            },
        )
    }
}
