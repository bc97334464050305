//! Condition evaluators: turn a metric value into a pass/fail decision.

pub mod change;
pub mod peak;
pub mod threshold;

use qwatch_common::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::history::MetricHistory;
use crate::metrics::MetricValue;
use change::{ChangeAggregation, ChangeCondition, ChangeEvaluator, ChangeType};
use peak::{PeakCondition, PeakDirection, PeakEvaluator};
use threshold::{CompareOp, ThresholdCondition, ThresholdEvaluator};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    #[default]
    None,
    Warning,
    Critical,
}

impl ErrorLevel {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ErrorLevel::None)
    }
}

impl std::fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorLevel::None => write!(f, "none"),
            ErrorLevel::Warning => write!(f, "warning"),
            ErrorLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Why an evaluation came out the way it did. Stored with every alert and
/// exposed to message templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleEvaluationState {
    Threshold {
        comparator: CompareOp,
        error_threshold: f64,
        warning_threshold: Option<f64>,
        value: f64,
        unit: Option<String>,
    },
    Peak {
        signal: i8,
        direction: PeakDirection,
        deviations: f64,
        warning_deviations: Option<f64>,
        influence: f64,
        lag: usize,
        value: f64,
        trigger_count: usize,
        total: usize,
    },
    Change {
        comparator: CompareOp,
        error_threshold: f64,
        warning_threshold: Option<f64>,
        value: f64,
        unit: Option<String>,
        window_size: i64,
        time_shift: i64,
        change_type: ChangeType,
        aggregation: ChangeAggregation,
    },
}

/// Outcome of one evaluation tick.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub value: f64,
    pub triggered: bool,
    pub error_level: ErrorLevel,
    pub state: RuleEvaluationState,
}

impl EvaluationResult {
    pub fn new(value: f64, error_level: ErrorLevel, state: RuleEvaluationState) -> Self {
        Self {
            value,
            triggered: error_level.is_failure(),
            error_level,
            state,
        }
    }
}

/// Read-only inputs an evaluator may consult besides the metric value.
pub struct EvaluationContext<'a> {
    pub metric_id: &'a str,
    pub history: &'a MetricHistory,
}

/// A rule's condition, one variant per evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    Threshold(ThresholdCondition),
    Peak(PeakCondition),
    Change(ChangeCondition),
}

impl RuleCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleCondition::Threshold(_) => "threshold",
            RuleCondition::Peak(_) => "peak",
            RuleCondition::Change(_) => "change",
        }
    }

    /// Raw history (ms) the condition reads back each tick.
    pub fn history_span(&self) -> i64 {
        match self {
            RuleCondition::Peak(peak) => peak.window_size,
            _ => 0,
        }
    }

    /// Samples the condition reads from before its history span.
    pub fn history_depth(&self) -> usize {
        match self {
            RuleCondition::Peak(peak) => peak.lag,
            _ => 0,
        }
    }
}

pub enum ConditionEvaluator {
    Threshold(ThresholdEvaluator),
    Peak(PeakEvaluator),
    Change(ChangeEvaluator),
}

impl ConditionEvaluator {
    pub fn new(condition: &RuleCondition) -> Self {
        match condition {
            RuleCondition::Threshold(c) => Self::Threshold(ThresholdEvaluator::new(c.clone())),
            RuleCondition::Peak(c) => Self::Peak(PeakEvaluator::new(c.clone())),
            RuleCondition::Change(c) => Self::Change(ChangeEvaluator::new(c.clone())),
        }
    }

    pub fn evaluate(
        &mut self,
        ctx: &EvaluationContext<'_>,
        ts: Timestamp,
        value: &MetricValue,
    ) -> EvaluationResult {
        match self {
            Self::Threshold(eval) => eval.evaluate(value),
            Self::Peak(eval) => eval.evaluate(ctx, ts, value),
            Self::Change(eval) => eval.evaluate(ts, value),
        }
    }
}
