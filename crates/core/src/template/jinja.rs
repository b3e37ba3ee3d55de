//! Jinja2-style template rendering over the layered scope.
//!
//! Expressions are pure: no I/O, no host reflection. Values cross the
//! JSON/minijinja boundary through explicit conversion; JSON null maps to
//! undefined so missing paths render as empty strings, and `default(...)`
//! coerces them back to values.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{value::ValueKind, Environment, Error, ErrorKind, UndefinedBehavior, Value};
use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};

/// Template renderer with the engine's filter and test set.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// Create a new renderer with custom filters and tests registered.
    pub fn new() -> Self {
        let mut env = Environment::new();

        // Missing paths render as empty strings; `default(...)` coerces
        // them back to values.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        // Custom filters; replace/map/list/join and friends come from the
        // minijinja builtins.
        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("default", filter_default);
        env.add_filter("int", filter_int);
        env.add_filter("float", filter_float);
        env.add_filter("string", filter_string);
        env.add_filter("length", filter_length);
        env.add_filter("get", filter_get);
        env.add_filter("keys", filter_keys);
        env.add_filter("values", filter_values);
        env.add_filter("items", filter_items);

        env.add_test("defined", test_defined);
        env.add_test("undefined", test_undefined);
        env.add_test("none", test_none);
        env.add_test("string", test_string);
        env.add_test("number", test_number);
        env.add_test("sequence", test_sequence);
        env.add_test("mapping", test_mapping);

        Self { env }
    }

    /// Render a template string with the given scope.
    pub fn render(
        &self,
        template: &str,
        scope: &HashMap<String, serde_json::Value>,
    ) -> CoreResult<String> {
        // Non-template strings pass through untouched.
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }

        let ctx = json_to_value(scope);

        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| CoreError::Template(format!("parse '{}': {}", template, e)))?;

        tmpl.render(ctx)
            .map_err(|e| CoreError::Template(format!("render '{}': {}", template, e)))
    }

    /// Render a template and re-parse the output as a JSON value where it
    /// looks like one; falls back to a string.
    pub fn render_to_value(
        &self,
        template: &str,
        scope: &HashMap<String, serde_json::Value>,
    ) -> CoreResult<serde_json::Value> {
        let rendered = self.render(template, scope)?;

        let trimmed = rendered.trim();
        if (trimmed.starts_with('{') && trimmed.ends_with('}'))
            || (trimmed.starts_with('[') && trimmed.ends_with(']'))
        {
            if let Ok(value) = serde_json::from_str(trimmed) {
                return Ok(value);
            }
        }

        if let Ok(b) = trimmed.parse::<bool>() {
            return Ok(serde_json::Value::Bool(b));
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Ok(serde_json::Value::Number(i.into()));
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Ok(serde_json::Value::Number(n));
            }
        }
        if trimmed == "null" || trimmed == "none" || trimmed.is_empty() {
            return Ok(serde_json::Value::Null);
        }

        Ok(serde_json::Value::String(rendered))
    }

    /// Render a nested structure (mapping or list) recursively.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        scope: &HashMap<String, serde_json::Value>,
    ) -> CoreResult<serde_json::Value> {
        match value {
            serde_json::Value::String(s) => self.render_to_value(s, scope),
            serde_json::Value::Object(map) => {
                let mut result = serde_json::Map::new();
                for (k, v) in map {
                    let rendered_key = self.render(k, scope)?;
                    let rendered_value = self.render_value(v, scope)?;
                    result.insert(rendered_key, rendered_value);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_value(v, scope)).collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate a condition expression to a boolean.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        scope: &HashMap<String, serde_json::Value>,
    ) -> CoreResult<bool> {
        let template = if contains_template_syntax(condition) {
            condition.to_string()
        } else {
            format!("{{{{ {} }}}}", condition)
        };

        let rendered = self.render(&template, scope)?;
        let trimmed = rendered.trim().to_lowercase();

        Ok(matches!(trimmed.as_str(), "true" | "1" | "yes"))
    }
}

/// Whether a string contains template syntax.
pub fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// Convert a JSON scope map to a minijinja value.
fn json_to_value(scope: &HashMap<String, serde_json::Value>) -> Value {
    let converted: HashMap<String, Value> = scope
        .iter()
        .map(|(k, v)| (k.clone(), json_value_to_minijinja(v)))
        .collect();
    Value::from_object(converted)
}

/// Convert a serde_json value to a minijinja value. Null becomes undefined
/// so missing paths render as empty strings.
fn json_value_to_minijinja(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::UNDEFINED,
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                Value::UNDEFINED
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(arr) => {
            let items: Vec<Value> = arr.iter().map(json_value_to_minijinja).collect();
            Value::from(items)
        }
        serde_json::Value::Object(map) => {
            let items: HashMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_value_to_minijinja(v)))
                .collect();
            Value::from_object(items)
        }
    }
}

/// Convert a minijinja value back to serde_json.
fn minijinja_to_json(value: &Value) -> serde_json::Value {
    if value.is_undefined() || value.is_none() {
        return serde_json::Value::Null;
    }
    if value.kind() == ValueKind::Bool {
        return serde_json::Value::Bool(value.is_true());
    }
    if let Some(i) = value.as_i64() {
        return serde_json::Value::Number(i.into());
    }
    if let Some(s) = value.as_str() {
        return serde_json::Value::String(s.to_string());
    }
    if value.kind() == ValueKind::Seq {
        if let Ok(iter) = value.try_iter() {
            let arr: Vec<serde_json::Value> = iter.map(|v| minijinja_to_json(&v)).collect();
            return serde_json::Value::Array(arr);
        }
    }
    if value.kind() == ValueKind::Map {
        let mut map = serde_json::Map::new();
        if let Ok(iter) = value.try_iter() {
            for key in iter {
                if let Ok(val) = value.get_item(&key) {
                    map.insert(key.to_string(), minijinja_to_json(&val));
                }
            }
        }
        return serde_json::Value::Object(map);
    }
    serde_json::Value::String(value.to_string())
}

// ============================================================================
// Custom filters
// ============================================================================

fn filter_b64encode(value: &Value) -> Result<String, Error> {
    let s = value.to_string();
    Ok(BASE64.encode(s.as_bytes()))
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let s = value.to_string();
    let decoded = BASE64.decode(s.as_bytes()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("b64decode error: {}", e),
        )
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    let json_val = minijinja_to_json(value);
    serde_json::to_string(&json_val)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let s = value.to_string();
    let json_val: serde_json::Value = serde_json::from_str(&s).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("fromjson error: {}", e),
        )
    })?;
    Ok(json_value_to_minijinja(&json_val))
}

fn filter_default(value: &Value, default: Option<&Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.cloned().unwrap_or(Value::from(""))
    } else {
        value.clone()
    }
}

fn filter_int(value: &Value) -> Result<i64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    let s = value.to_string();
    if let Ok(f) = s.parse::<f64>() {
        return Ok(f as i64);
    }
    s.parse::<i64>()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("int error: {}", e)))
}

fn filter_float(value: &Value) -> Result<f64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i as f64);
    }
    let s = value.to_string();
    s.parse::<f64>()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("float error: {}", e)))
}

fn filter_string(value: &Value) -> String {
    value.to_string()
}

fn filter_length(value: &Value) -> Result<usize, Error> {
    if let Some(s) = value.as_str() {
        return Ok(s.len());
    }
    if let Some(len) = value.len() {
        return Ok(len);
    }
    Err(Error::new(
        ErrorKind::InvalidOperation,
        "length requires string, sequence, or mapping",
    ))
}

fn filter_get(value: &Value, key: &Value) -> Value {
    value.get_item(key).unwrap_or(Value::UNDEFINED)
}

fn filter_keys(value: &Value) -> Result<Vec<String>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "keys requires a mapping",
        ));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "cannot iterate keys"))?;
    Ok(iter.map(|v| v.to_string()).collect())
}

fn filter_values(value: &Value) -> Result<Vec<Value>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "values requires a mapping",
        ));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "cannot iterate values"))?;
    let mut result = Vec::new();
    for key in iter {
        if let Ok(val) = value.get_item(&key) {
            result.push(val);
        }
    }
    Ok(result)
}

fn filter_items(value: &Value) -> Result<Vec<Vec<Value>>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "items requires a mapping",
        ));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "cannot iterate items"))?;
    let mut result = Vec::new();
    for key in iter {
        if let Ok(val) = value.get_item(&key) {
            result.push(vec![key.clone(), val]);
        }
    }
    Ok(result)
}

// ============================================================================
// Custom tests
// ============================================================================

fn test_defined(value: &Value) -> bool {
    !value.is_undefined()
}

fn test_undefined(value: &Value) -> bool {
    value.is_undefined()
}

fn test_none(value: &Value) -> bool {
    value.is_none()
}

fn test_string(value: &Value) -> bool {
    value.kind() == ValueKind::String
}

fn test_number(value: &Value) -> bool {
    value.kind() == ValueKind::Number
}

fn test_sequence(value: &Value) -> bool {
    value.kind() == ValueKind::Seq
}

fn test_mapping(value: &Value) -> bool {
    value.kind() == ValueKind::Map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_scope() -> HashMap<String, serde_json::Value> {
        let mut scope = HashMap::new();
        scope.insert("name".to_string(), serde_json::json!("floe"));
        scope.insert("count".to_string(), serde_json::json!(5));
        scope.insert("active".to_string(), serde_json::json!(true));
        scope.insert("items".to_string(), serde_json::json!(["a", "b", "c"]));
        scope.insert(
            "response".to_string(),
            serde_json::json!({"paging": {"page": 2, "hasMore": true}}),
        );
        scope
    }

    #[test]
    fn test_simple_variable() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("hello {{ name }}", &make_scope()).unwrap();
        assert_eq!(result, "hello floe");
    }

    #[test]
    fn test_plain_string_passthrough() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("plain text", &make_scope()).unwrap();
        assert_eq!(result, "plain text");
    }

    #[test]
    fn test_missing_path_renders_empty() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("[{{ nothing.here }}]", &make_scope()).unwrap();
        assert_eq!(result, "[]");
    }

    #[test]
    fn test_default_filter() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render("{{ missing | default('fallback') }}", &make_scope())
            .unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn test_b64encode_filter() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("{{ name | b64encode }}", &make_scope()).unwrap();
        assert_eq!(result, "ZmxvZQ==");
    }

    #[test]
    fn test_length_filter() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("{{ items | length }}", &make_scope()).unwrap();
        assert_eq!(result, "3");
    }

    #[test]
    fn test_replace_builtin() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render("{{ name | replace('f', 'g') }}", &make_scope())
            .unwrap();
        assert_eq!(result, "gloe");
    }

    #[test]
    fn test_tojson_roundtrip() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render_to_value("{{ response | tojson }}", &make_scope())
            .unwrap();
        assert_eq!(result["paging"]["page"], 2);
    }

    #[test]
    fn test_evaluate_condition() {
        let renderer = TemplateRenderer::new();
        let scope = make_scope();

        assert!(renderer.evaluate_condition("count > 3", &scope).unwrap());
        assert!(!renderer.evaluate_condition("count > 10", &scope).unwrap());
        assert!(renderer.evaluate_condition("active", &scope).unwrap());
        assert!(renderer
            .evaluate_condition("response.paging.hasMore", &scope)
            .unwrap());
        assert!(!renderer.evaluate_condition("missing", &scope).unwrap());
    }

    #[test]
    fn test_arithmetic_in_expression() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render_to_value("{{ response.paging.page + 1 }}", &make_scope())
            .unwrap();
        assert_eq!(result, serde_json::json!(3));
    }

    #[test]
    fn test_render_to_value_number() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render_to_value("{{ count }}", &make_scope()).unwrap();
        assert_eq!(result, serde_json::json!(5));
    }

    #[test]
    fn test_render_to_value_list_passthrough() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render_to_value("{{ items | tojson }}", &make_scope())
            .unwrap();
        assert_eq!(result, serde_json::json!(["a", "b", "c"]));
    }

    #[test]
    fn test_render_value_nested() {
        let renderer = TemplateRenderer::new();
        let value = serde_json::json!({
            "greeting": "hi {{ name }}",
            "inner": {"total": "{{ count }}"}
        });
        let result = renderer.render_value(&value, &make_scope()).unwrap();
        assert_eq!(result["greeting"], "hi floe");
        assert_eq!(result["inner"]["total"], 5);
    }

    #[test]
    fn test_template_error_carries_expression() {
        let renderer = TemplateRenderer::new();
        let err = renderer
            .render("{{ items | nonexistent_filter }}", &make_scope())
            .unwrap_err();
        assert!(err.to_string().contains("nonexistent_filter"));
    }
}
