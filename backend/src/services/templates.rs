// Template rendering for `{variable}` merge fields

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::workflows::context::resolve_path;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}")
        .expect("placeholder pattern is valid")
});

/// Substitute `{name}` / `{client.first_name}` placeholders. Unresolved ones stay verbatim.
pub fn render(template: &str, variables: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            match resolve_path(variables, &caps[1]) {
                Some(value) => display_value(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Render every string inside a JSON value
pub fn render_value(value: &Value, variables: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, variables)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, variables)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Placeholders in `template` that `variables` cannot resolve
pub fn unresolved_placeholders(template: &str, variables: &Map<String, Value>) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .filter(|caps| resolve_path(variables, &caps[1]).is_none())
        .map(|caps| caps[1].to_string())
        .collect()
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
