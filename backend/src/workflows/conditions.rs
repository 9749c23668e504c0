// Workflow Conditions - Predicates gating step execution

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::context::resolve_path;

/// A single predicate over the execution context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dot-path into the context (e.g. `client.tags`)
    pub field: String,
    pub operator: ConditionOperator,
    /// Comparison value, ignored by the emptiness operators
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn not_equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::NotEquals, value)
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, ConditionOperator::Contains, Value::String(value.to_string()))
    }

    pub fn not_contains(field: &str, value: &str) -> Self {
        Self::new(field, ConditionOperator::NotContains, Value::String(value.to_string()))
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, serde_json::json!(value))
    }

    pub fn less_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::LessThan, serde_json::json!(value))
    }

    pub fn is_empty(field: &str) -> Self {
        Self::new(field, ConditionOperator::IsEmpty, Value::Null)
    }

    pub fn is_not_empty(field: &str) -> Self {
        Self::new(field, ConditionOperator::IsNotEmpty, Value::Null)
    }

    pub fn is_satisfied(&self, context: &Map<String, Value>) -> bool {
        let actual = resolve_path(context, &self.field);

        match self.operator {
            ConditionOperator::Equals => values_equal(actual, &self.value),
            ConditionOperator::NotEquals => !values_equal(actual, &self.value),
            ConditionOperator::Contains => contains(actual, &self.value),
            ConditionOperator::NotContains => !contains(actual, &self.value),
            ConditionOperator::GreaterThan => compare(actual, &self.value, |a, b| a > b),
            ConditionOperator::LessThan => compare(actual, &self.value, |a, b| a < b),
            ConditionOperator::IsEmpty => is_empty(actual),
            ConditionOperator::IsNotEmpty => !is_empty(actual),
        }
    }
}

/// All conditions must hold. An empty list holds.
pub fn evaluate(conditions: &[Condition], context: &Map<String, Value>) -> bool {
    conditions.iter().all(|c| c.is_satisfied(context))
}

/// Typed equality. Numbers compare numerically (numeric strings are coerced),
/// booleans match the strings "true"/"false", everything else compares exactly.
/// A missing field only equals `null`.
fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    let Some(actual) = actual else {
        return expected.is_null();
    };

    match (actual, expected) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (as_number(actual), as_number(expected)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => actual == expected,
    }
}

fn contains(actual: Option<&Value>, needle: &Value) -> bool {
    match actual {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => items.iter().any(|item| values_equal(Some(item), needle)),
        Some(other) => stringify(other)
            .to_lowercase()
            .contains(&stringify(needle).to_lowercase()),
    }
}

fn compare(actual: Option<&Value>, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(as_number), as_number(expected)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn is_empty(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Common condition presets for client automations
pub mod presets {
    use super::*;

    pub fn has_tag(tag: &str) -> Condition {
        Condition::contains("client.tags", tag)
    }

    pub fn has_email() -> Condition {
        Condition::is_not_empty("client.email")
    }

    pub fn has_phone() -> Condition {
        Condition::is_not_empty("client.phones")
    }

    pub fn appointment_type(appointment_type: &str) -> Condition {
        Condition::equals("appointment.appointment_type", Value::String(appointment_type.to_string()))
    }
}
