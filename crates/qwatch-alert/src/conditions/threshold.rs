use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{ErrorLevel, EvaluationResult, RuleEvaluationState};
use crate::metrics::{MetricValue, SketchReduction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "EQ", alias = "eq")]
    Eq,
    #[serde(rename = "NE", alias = "ne")]
    Ne,
    #[serde(rename = "GT", alias = "gt")]
    Gt,
    #[serde(rename = "GTE", alias = "gte")]
    Gte,
    #[serde(rename = "LT", alias = "lt")]
    Lt,
    #[serde(rename = "LTE", alias = "lte")]
    Lte,
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eq" | "==" => Ok(Self::Eq),
            "ne" | "!=" => Ok(Self::Ne),
            "gt" | ">" => Ok(Self::Gt),
            "gte" | ">=" => Ok(Self::Gte),
            "lt" | "<" => Ok(Self::Lt),
            "lte" | "<=" => Ok(Self::Lte),
            _ => Err(format!("unknown compare operator: {s}")),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Gt => "GT",
            Self::Gte => "GTE",
            Self::Lt => "LT",
            Self::Lte => "LTE",
        };
        f.write_str(name)
    }
}

impl CompareOp {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Eq => value == threshold,
            Self::Ne => value != threshold,
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCondition {
    pub operator: CompareOp,
    pub error_threshold: f64,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    /// Applied when the metric value is a sketch.
    #[serde(default)]
    pub reduction: SketchReduction,
}

impl ThresholdCondition {
    pub fn level(&self, value: f64) -> ErrorLevel {
        if self.operator.check(value, self.error_threshold) {
            ErrorLevel::Critical
        } else if self
            .warning_threshold
            .is_some_and(|w| self.operator.check(value, w))
        {
            ErrorLevel::Warning
        } else {
            ErrorLevel::None
        }
    }
}

pub struct ThresholdEvaluator {
    condition: ThresholdCondition,
}

impl ThresholdEvaluator {
    pub fn new(condition: ThresholdCondition) -> Self {
        Self { condition }
    }

    pub fn evaluate(&self, value: &MetricValue) -> EvaluationResult {
        let value = value.reduce(self.condition.reduction);
        let level = self.condition.level(value);
        EvaluationResult::new(
            value,
            level,
            RuleEvaluationState::Threshold {
                comparator: self.condition.operator,
                error_threshold: self.condition.error_threshold,
                warning_threshold: self.condition.warning_threshold,
                value,
                unit: self.condition.unit.clone(),
            },
        )
    }
}
