//! Helpers shared by channels and by alert message rendering.

use serde_json::Value;

use qwatch_common::types::TemplateContext;

/// Maximum number of characters of a remote response body kept in logs and errors.
pub const MAX_BODY_LENGTH: usize = 4000;

/// Truncates `s` to at most `max_len` bytes without splitting a character.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

/// Renders a JSON value as plain text: strings unquoted, floats with two
/// decimals, null as empty.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_f64() => n
            .as_f64()
            .map(|f| format!("{f:.2}"))
            .unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

/// Replaces every `{{key}}` placeholder with the matching context value.
/// Unknown placeholders are left untouched.
///
/// # Examples
///
/// ```
/// use qwatch_notify::utils::render_template;
///
/// let mut ctx = serde_json::Map::new();
/// ctx.insert("metric".into(), "queue.wait_time".into());
/// ctx.insert("value".into(), serde_json::json!(12.5));
/// let out = render_template("{{metric}} = {{value}} {{unit}}", &ctx);
/// assert_eq!(out, "queue.wait_time = 12.50 {{unit}}");
/// ```
pub fn render_template(template: &str, context: &TemplateContext) -> String {
    let mut out = template.to_string();
    for (key, value) in context {
        let placeholder = format!("{{{{{key}}}}}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, &value_to_text(value));
        }
    }
    out
}
