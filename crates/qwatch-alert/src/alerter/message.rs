//! Alert titles, messages and the template contexts handed to notifiers.

use qwatch_common::types::TemplateContext;
use qwatch_notify::utils::render_template;
use serde_json::{json, Value};

use super::types::RuleAlert;
use crate::conditions::change::ChangeType;
use crate::conditions::{ErrorLevel, EvaluationResult, RuleEvaluationState};
use crate::error::Result;
use crate::rule::Rule;

fn object(value: Value) -> TemplateContext {
    match value {
        Value::Object(map) => map,
        _ => TemplateContext::new(),
    }
}

/// Rule fields every notification carries.
pub fn base_context(rule: &Rule, host_id: &str) -> TemplateContext {
    object(json!({
        "rule_id": rule.id,
        "rule_name": rule.name,
        "description": rule.description,
        "metric": rule.metric_id,
        "queue_id": rule.queue_id,
        "host_id": host_id,
        "severity": rule.severity,
        "condition": rule.condition.kind(),
    }))
}

/// Values of one evaluation, flattened for templates.
pub fn evaluation_context(result: &EvaluationResult) -> Result<TemplateContext> {
    let mut ctx = object(serde_json::to_value(&result.state)?);
    ctx.remove("type");
    ctx.insert("value".into(), json!(result.value));
    ctx.insert("error_level".into(), json!(result.error_level));
    ctx.insert("triggered".into(), json!(result.triggered));
    Ok(ctx)
}

/// Fields of a stored alert, including its evaluation state.
pub fn alert_context(alert: &RuleAlert) -> Result<TemplateContext> {
    let mut ctx = object(serde_json::to_value(&alert.state)?);
    ctx.remove("type");
    ctx.extend(object(json!({
        "alert_id": alert.id,
        "status": alert.status,
        "raised_at": alert.raised_at,
        "reset_at": alert.reset_at,
        "value": alert.value,
        "failures": alert.failures,
        "title": alert.title,
        "message": alert.message,
        "error_level": alert.error_level,
        "severity": alert.severity,
    })));
    Ok(ctx)
}

/// Merges `extra` over `base`; later keys win.
pub fn merge(mut base: TemplateContext, extra: TemplateContext) -> TemplateContext {
    base.extend(extra);
    base
}

pub fn render_title(rule: &Rule, level: ErrorLevel) -> String {
    format!("[{}] {}", level.to_string().to_uppercase(), rule.name)
}

/// Renders the rule's own template against `ctx`, or a default sentence
/// describing the evaluation.
pub fn render_message(rule: &Rule, result: &EvaluationResult, ctx: &TemplateContext) -> String {
    if let Some(template) = rule.message.as_deref().filter(|t| !t.trim().is_empty()) {
        return render_template(template, ctx);
    }
    let metric = &rule.metric_id;
    let warning = result.error_level == ErrorLevel::Warning;

    match &result.state {
        RuleEvaluationState::Threshold {
            comparator,
            error_threshold,
            warning_threshold,
            value,
            unit,
        } => {
            let threshold = active_threshold(warning, *error_threshold, *warning_threshold);
            let unit = unit.as_deref().unwrap_or("");
            format!(
                "{metric} is {value:.2}{unit} ({} {threshold:.2}{unit})",
                comparator.symbol()
            )
        }
        RuleEvaluationState::Peak {
            signal,
            deviations,
            warning_deviations,
            trigger_count,
            total,
            ..
        } => {
            let deviations = active_threshold(warning, *deviations, *warning_deviations);
            let direction = match signal.signum() {
                1 => "above",
                -1 => "below",
                _ => "away from",
            };
            format!(
                "{metric} peaked {direction} its baseline: {trigger_count} of {total} samples beyond {deviations:.1} standard deviations"
            )
        }
        RuleEvaluationState::Change {
            comparator,
            error_threshold,
            warning_threshold,
            value,
            unit,
            window_size,
            change_type,
            aggregation,
            ..
        } => {
            let threshold = active_threshold(warning, *error_threshold, *warning_threshold);
            let unit = match change_type {
                ChangeType::Percentage => "%",
                ChangeType::Value => unit.as_deref().unwrap_or(""),
            };
            format!(
                "{metric} changed by {value:.2}{unit} ({aggregation:?} over {window_size}ms, {} {threshold:.2}{unit})",
                comparator.symbol()
            )
        }
    }
}

fn active_threshold(warning: bool, error: f64, warn: Option<f64>) -> f64 {
    match (warning, warn) {
        (true, Some(w)) => w,
        _ => error,
    }
}
