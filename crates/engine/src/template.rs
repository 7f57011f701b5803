//! `${{ inputs.NAME }}` / `${{ secrets.NAME }}` substitution over a JSON
//! value tree.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::EngineError;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{\{(.*?)\}\}").expect("valid regex"))
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(inputs|secrets)\.([A-Za-z_][A-Za-z0-9_]*)$").expect("valid regex")
    })
}

/// Values a template may reference.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub inputs: Map<String, Value>,
    pub secrets: Map<String, Value>,
}

impl TemplateContext {
    pub fn new(inputs: Map<String, Value>, secrets: Map<String, Value>) -> Self {
        Self { inputs, secrets }
    }
}

/// Render every string in `spec`. Object keys and non-string scalars pass
/// through unchanged.
pub fn render(spec: &Value, ctx: &TemplateContext) -> Result<Value, EngineError> {
    match spec {
        Value::String(s) => render_str(s, ctx).map(Value::String),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Ok((key.clone(), render(value, ctx)?)))
            .collect::<Result<Map<_, _>, EngineError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

pub fn render_str(input: &str, ctx: &TemplateContext) -> Result<String, EngineError> {
    let mut failure = None;
    let rendered = token_pattern().replace_all(input, |caps: &Captures<'_>| {
        match resolve(caps[1].trim(), ctx) {
            Ok(value) => value,
            Err(err) => {
                failure.get_or_insert(err);
                String::new()
            }
        }
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(rendered.into_owned()),
    }
}

/// Every `(kind, name)` referenced by the strings of `spec`.
pub fn references(spec: &Value) -> Result<Vec<(String, String)>, EngineError> {
    let mut found = Vec::new();
    collect_references(spec, &mut found)?;
    Ok(found)
}

fn collect_references(spec: &Value, found: &mut Vec<(String, String)>) -> Result<(), EngineError> {
    match spec {
        Value::String(s) => {
            for caps in token_pattern().captures_iter(s) {
                let expression = caps[1].trim();
                let parts = reference_pattern()
                    .captures(expression)
                    .ok_or_else(|| invalid_expression(expression))?;
                found.push((parts[1].to_string(), parts[2].to_string()));
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|item| collect_references(item, found)),
        Value::Object(map) => map.values().try_for_each(|value| collect_references(value, found)),
        _ => Ok(()),
    }
}

fn resolve(expression: &str, ctx: &TemplateContext) -> Result<String, EngineError> {
    let parts = reference_pattern()
        .captures(expression)
        .ok_or_else(|| invalid_expression(expression))?;
    let (kind, name) = (&parts[1], &parts[2]);
    let source = if kind == "inputs" { &ctx.inputs } else { &ctx.secrets };

    match source.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(value) => Ok(value.to_string()),
        None => Err(EngineError::Template(format!("{kind}.{name} not found"))),
    }
}

fn invalid_expression(expression: &str) -> EngineError {
    EngineError::Template(format!("invalid expression '{expression}'"))
}
