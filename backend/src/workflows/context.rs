// Execution Context - Versioned key/value state carried through an enrollment

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Context map seeded from the triggering event and enriched by step results.
///
/// Steps receive the context by reference and never mutate it; the executor
/// produces the next version with [`ExecutionContext::merged`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    version: u64,
    values: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { version: 0, values }
    }

    /// Rebuild a persisted context
    pub fn restore(version: u64, values: Map<String, Value>) -> Self {
        Self { version, values }
    }

    /// Build a context from arbitrary JSON. Non-object payloads are kept under `payload`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::new(map),
            Value::Null => Self::default(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                Self::new(map)
            }
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Look up a dot-path such as `client.tags` or `client.phones.0`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        resolve_path(&self.values, path)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn get_uuid(&self, path: &str) -> Option<Uuid> {
        self.get_str(path).and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Next version with `output` merged over the current values.
    pub fn merged(mut self, output: &Map<String, Value>) -> Self {
        if output.is_empty() {
            return self;
        }
        for (key, value) in output {
            self.values.insert(key.clone(), value.clone());
        }
        self.version += 1;
        self
    }

    pub fn with_value(self, key: &str, value: Value) -> Self {
        let mut output = Map::new();
        output.insert(key.to_string(), value);
        self.merged(&output)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

/// Resolve a dot-separated path against a JSON object. Numeric segments index arrays.
pub fn resolve_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}
