//! `${{ ... }}` placeholder handling.
//!
//! Placeholders are located with a regex pre-filter; each body is then handed
//! to the full tokenizer/parser independently. The pre-filter skips over
//! quoted string literals, so `'}}'` inside a body does not close it.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::ExpressionError;
use super::eval::{ExpressionContext, evaluate};
use super::parser::parse;

// Body: plain characters, complete '...' or "..." literals (backslash
// escapes included), or a lone `}`.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)\$\{\{((?:[^}'"]|'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*"|\}[^}'"])*?)\}\}"#,
    )
    .expect("valid regex")
});

const OPEN: &str = "${{";

/// Trimmed body of every placeholder in `text`, in order of appearance.
pub fn extract_expressions(text: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

/// Whether `text` contains at least one placeholder.
pub fn has_placeholder(text: &str) -> bool {
    PLACEHOLDER.is_match(text)
}

/// Replace every placeholder with its rendered value.
///
/// Booleans render as `true`/`false`, `null` as the empty string, strings
/// verbatim, anything else as compact JSON. One bad placeholder fails the
/// whole call.
pub fn resolve_string(template: &str, ctx: &ExpressionContext) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let literal = &template[last..whole.start()];
        check_unterminated(literal)?;
        out.push_str(literal);

        let value = evaluate(&parse(body.as_str())?, ctx)?;
        out.push_str(&render_value(&value));
        last = whole.end();
    }

    let tail = &template[last..];
    check_unterminated(tail)?;
    out.push_str(tail);
    Ok(out)
}

/// Like [`resolve_string`], but a template that is exactly one placeholder
/// yields the raw value so numbers, arrays and objects keep their type.
pub fn resolve_value(template: &str, ctx: &ExpressionContext) -> Result<Value, ExpressionError> {
    let trimmed = template.trim();
    if let Some(caps) = PLACEHOLDER.captures(trimmed) {
        if let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) {
            if whole.start() == 0 && whole.end() == trimmed.len() {
                return evaluate(&parse(body.as_str())?, ctx);
            }
        }
    }
    resolve_string(template, ctx).map(Value::String)
}

/// Evaluate a `condition` field. Bare expressions without a placeholder are
/// accepted too.
pub fn evaluate_condition(condition: &str, ctx: &ExpressionContext) -> Result<bool, ExpressionError> {
    let value = if has_placeholder(condition) {
        resolve_value(condition, ctx)?
    } else {
        evaluate(&parse(condition)?, ctx)?
    };
    Ok(match value {
        // A mixed template renders to a string; interpret the common literals.
        Value::String(s) => !matches!(s.trim(), "" | "false" | "0" | "null"),
        other => super::eval::is_truthy(&other),
    })
}

pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn check_unterminated(literal: &str) -> Result<(), ExpressionError> {
    if literal.contains(OPEN) {
        return Err(ExpressionError::Template(
            "unterminated '${{' placeholder".to_string(),
        ));
    }
    Ok(())
}
