//! Layered per-step variable scope.
//!
//! The scope is a flat JSON map built outermost to innermost: workload,
//! prior step results by step name, the iteration element, the triggering
//! event, the current result/response, execution metadata, and resolved
//! credentials under `auth`. Later layers shadow earlier ones.

use std::collections::HashMap;

use serde_json::Value;

use crate::event::Event;
use crate::sensitive::Sensitive;

/// Builder for the rendering scope of one step.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    inner: HashMap<String, Value>,
}

impl Scope {
    /// Start an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a scope from a serialized context (queue row `context`).
    pub fn from_value(value: &Value) -> Self {
        let inner = match value {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => HashMap::new(),
        };
        Self { inner }
    }

    /// Outermost layer: the execution workload under `workload`.
    pub fn with_workload(mut self, workload: &Value) -> Self {
        self.inner.insert("workload".to_string(), workload.clone());
        self
    }

    /// Prior step results, addressed directly by step name.
    pub fn with_step_results(mut self, results: &HashMap<String, Value>) -> Self {
        for (name, result) in results {
            self.inner.insert(name.clone(), result.clone());
        }
        self
    }

    /// Bind the iteration element under its declared name, with `_index`
    /// and `_total` beside it.
    pub fn with_item(mut self, element: &str, item: &Value, index: usize, total: usize) -> Self {
        self.inner.insert(element.to_string(), item.clone());
        self.inner.insert("_index".to_string(), Value::from(index));
        self.inner.insert("_total".to_string(), Value::from(total));
        self
    }

    /// Bind the triggering event under `event`.
    pub fn with_event(mut self, event: &Event) -> Self {
        let value = serde_json::to_value(event).unwrap_or(Value::Null);
        self.inner.insert("event".to_string(), value);
        self
    }

    /// Bind the current tool output under both `result` and `response`.
    pub fn with_result(mut self, result: &Value) -> Self {
        self.inner.insert("result".to_string(), result.clone());
        self.inner.insert("response".to_string(), result.clone());
        self
    }

    /// Bind the structured error under `error` and set the `failed` flag.
    pub fn with_error(mut self, error: &Value) -> Self {
        self.inner.insert("error".to_string(), error.clone());
        self.inner.insert("failed".to_string(), Value::Bool(true));
        self
    }

    /// Mark the scope as a success path (`failed` = false).
    pub fn with_success(mut self) -> Self {
        self.inner.insert("failed".to_string(), Value::Bool(false));
        self
    }

    /// Execution metadata.
    pub fn with_execution_id(mut self, execution_id: i64) -> Self {
        self.inner
            .insert("execution_id".to_string(), Value::from(execution_id));
        self
    }

    /// Innermost layer: resolved credentials under `auth.<alias>.<field>`.
    /// Values are revealed here and only here; the scope itself never
    /// reaches the event log unsanitized.
    pub fn with_auth(
        mut self,
        auth: &HashMap<String, HashMap<String, Sensitive<String>>>,
    ) -> Self {
        let mut auth_map = serde_json::Map::new();
        for (alias, fields) in auth {
            let mut field_map = serde_json::Map::new();
            for (field, value) in fields {
                field_map.insert(field.clone(), Value::String(value.reveal().clone()));
            }
            auth_map.insert(alias.clone(), Value::Object(field_map));
        }
        self.inner.insert("auth".to_string(), Value::Object(auth_map));
        self
    }

    /// Insert a single binding.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.inner.insert(key.into(), value);
    }

    /// The scope as a map for the template renderer.
    pub fn as_map(&self) -> &HashMap<String, Value> {
        &self.inner
    }

    /// Consume into the renderer map.
    pub fn into_map(self) -> HashMap<String, Value> {
        self.inner
    }

    /// Serialize to a JSON object (queue row `context`). The `auth` layer
    /// is stripped: credentials are resolved per attempt, never persisted.
    pub fn to_context_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.inner {
            if k == "auth" {
                continue;
            }
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }
}
