//! Retry controller: error-side backoff and success-side pagination.
//!
//! Both sides share one attempt counter, visible in the event log. The
//! error side decides whether a failed attempt gets another shot and how
//! long to wait; the success side decides whether a completed call should
//! continue to the next page and how to rewrite the request.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{ActionError, CoreResult, ErrorKind};
use crate::playbook::types::{CollectSpec, CollectStrategy, ErrorRetryPolicy, PaginationPolicy};
use crate::template::TemplateRenderer;

/// Outcome of error-side retry evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDecision {
    /// Schedule another attempt after the given delay (seconds).
    Retry { delay: f64, next_attempt: i32 },
    /// Policy declined; the failure stands.
    GiveUp,
}

/// Outcome of success-side pagination evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PageDecision {
    /// Fetch another page as the given attempt.
    Continue { next_attempt: i32 },
    /// Pagination finished; aggregate and complete the step.
    Finish,
}

/// Evaluate the error-side policy for an attempt that just failed.
///
/// `attempts` is the attempt number that failed (1-based). A missing `when`
/// matches any error except cancellation; cancellation is never retried.
pub fn evaluate_error_retry(
    policy: &ErrorRetryPolicy,
    attempts: i32,
    error: &ActionError,
    scope: &HashMap<String, Value>,
    renderer: &TemplateRenderer,
) -> CoreResult<ErrorDecision> {
    if error.kind == ErrorKind::Cancelled {
        return Ok(ErrorDecision::GiveUp);
    }

    let matched = match &policy.when {
        Some(expr) => renderer.evaluate_condition(expr, scope)?,
        None => true,
    };
    if !matched {
        return Ok(ErrorDecision::GiveUp);
    }

    if let Some(stop) = &policy.stop_when {
        if renderer.evaluate_condition(stop, scope)? {
            return Ok(ErrorDecision::GiveUp);
        }
    }

    if attempts >= policy.max_attempts {
        return Ok(ErrorDecision::GiveUp);
    }

    let mut delay = backoff_delay(policy, attempts);
    if let Some(jitter) = policy.jitter {
        delay = apply_jitter(delay, jitter);
    }

    Ok(ErrorDecision::Retry {
        delay,
        next_attempt: attempts + 1,
    })
}

/// Exponential backoff: `min(max_delay, initial_delay * multiplier^(n-1))`.
pub fn backoff_delay(policy: &ErrorRetryPolicy, attempt: i32) -> f64 {
    let exponent = (attempt - 1).max(0);
    let raw = policy.initial_delay * policy.multiplier.powi(exponent);
    raw.min(policy.max_delay)
}

/// Proportional jitter: the delay varies by up to +/- `jitter * delay`.
pub fn apply_jitter(delay: f64, jitter: f64) -> f64 {
    let jitter = jitter.clamp(0.0, 1.0);
    let factor = 1.0 + jitter * (rand::random::<f64>() * 2.0 - 1.0);
    (delay * factor).max(0.0)
}

/// Evaluate the success-side policy after a completed call.
///
/// `pages` is the number of completed calls so far (1-based, including the
/// one that just finished). The scope must carry `response`.
pub fn evaluate_pagination(
    policy: &PaginationPolicy,
    pages: i32,
    scope: &HashMap<String, Value>,
    renderer: &TemplateRenderer,
) -> CoreResult<PageDecision> {
    if pages >= policy.max_attempts {
        return Ok(PageDecision::Finish);
    }

    if renderer.evaluate_condition(&policy.while_expr, scope)? {
        Ok(PageDecision::Continue {
            next_attempt: pages + 1,
        })
    } else {
        Ok(PageDecision::Finish)
    }
}

/// Render the `next_call` overrides and merge them atop the previous call
/// arguments, producing the concrete arguments for the next page.
pub fn next_call_args(
    policy: &PaginationPolicy,
    prev_args: &Value,
    scope: &HashMap<String, Value>,
    renderer: &TemplateRenderer,
) -> CoreResult<Value> {
    let overrides = match &policy.next_call {
        Some(spec) => renderer.render_value(spec, scope)?,
        None => Value::Null,
    };
    Ok(deep_merge(prev_args, &overrides))
}

/// Merge `overlay` onto `base`, recursing into objects; overlay wins.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let entry = merged.entry(key.clone()).or_insert(Value::Null);
                *entry = deep_merge(entry, value);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

/// Follow a dotted path into a JSON value.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Accumulate the selected `path` slice of every page per the strategy.
pub fn aggregate_pages(collect: &CollectSpec, pages: &[Value]) -> Value {
    match collect.strategy {
        CollectStrategy::Append => {
            let mut buffer = Vec::new();
            for page in pages {
                match json_path(page, &collect.path) {
                    Some(Value::Array(items)) => buffer.extend(items.iter().cloned()),
                    Some(other) => buffer.push(other.clone()),
                    None => {}
                }
            }
            Value::Array(buffer)
        }
        CollectStrategy::Merge => {
            let mut buffer = Value::Object(serde_json::Map::new());
            for page in pages {
                if let Some(slice) = json_path(page, &collect.path) {
                    buffer = deep_merge(&buffer, slice);
                }
            }
            buffer
        }
        CollectStrategy::Replace => pages
            .last()
            .and_then(|page| json_path(page, &collect.path))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

/// Build the final step result: the last page's response with the
/// accumulated buffer written under `collect.into`.
pub fn finalize_paginated_result(collect: &CollectSpec, pages: &[Value]) -> Value {
    let buffer = aggregate_pages(collect, pages);
    let mut result = match pages.last() {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(other) => other.clone(),
        None => Value::Object(serde_json::Map::new()),
    };
    if let Value::Object(map) = &mut result {
        map.insert(collect.into.clone(), buffer);
    } else {
        let mut map = serde_json::Map::new();
        map.insert(collect.into.clone(), buffer);
        result = Value::Object(map);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: i32) -> ErrorRetryPolicy {
        ErrorRetryPolicy {
            when: None,
            max_attempts,
            initial_delay: 1.0,
            multiplier: 2.0,
            max_delay: 60.0,
            jitter: None,
            stop_when: None,
        }
    }

    fn error_scope(error: &ActionError) -> HashMap<String, Value> {
        let mut scope = HashMap::new();
        scope.insert(
            "error".to_string(),
            serde_json::to_value(error).unwrap(),
        );
        scope
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = policy(5);
        assert_eq!(backoff_delay(&policy, 1), 1.0);
        assert_eq!(backoff_delay(&policy, 2), 2.0);
        assert_eq!(backoff_delay(&policy, 3), 4.0);
        assert_eq!(backoff_delay(&policy, 4), 8.0);
    }

    #[test]
    fn test_backoff_capped() {
        let mut policy = policy(10);
        policy.max_delay = 5.0;
        assert_eq!(backoff_delay(&policy, 4), 5.0);
    }

    #[test]
    fn test_retry_until_exhausted() {
        let renderer = TemplateRenderer::new();
        let policy = policy(3);
        let error = ActionError::dependency("503").with_status(503);
        let scope = error_scope(&error);

        let first = evaluate_error_retry(&policy, 1, &error, &scope, &renderer).unwrap();
        assert_eq!(
            first,
            ErrorDecision::Retry {
                delay: 1.0,
                next_attempt: 2
            }
        );

        let second = evaluate_error_retry(&policy, 2, &error, &scope, &renderer).unwrap();
        assert_eq!(
            second,
            ErrorDecision::Retry {
                delay: 2.0,
                next_attempt: 3
            }
        );

        let third = evaluate_error_retry(&policy, 3, &error, &scope, &renderer).unwrap();
        assert_eq!(third, ErrorDecision::GiveUp);
    }

    #[test]
    fn test_when_expression_gates_retry() {
        let renderer = TemplateRenderer::new();
        let mut policy = policy(3);
        policy.when = Some("error.status == 503".to_string());

        let matching = ActionError::dependency("503").with_status(503);
        let decision =
            evaluate_error_retry(&policy, 1, &matching, &error_scope(&matching), &renderer)
                .unwrap();
        assert!(matches!(decision, ErrorDecision::Retry { .. }));

        let other = ActionError::dependency("401").with_status(401);
        let decision =
            evaluate_error_retry(&policy, 1, &other, &error_scope(&other), &renderer).unwrap();
        assert_eq!(decision, ErrorDecision::GiveUp);
    }

    #[test]
    fn test_cancelled_never_retries() {
        let renderer = TemplateRenderer::new();
        let policy = policy(3);
        let error = ActionError::cancelled("shutdown");
        let decision =
            evaluate_error_retry(&policy, 1, &error, &error_scope(&error), &renderer).unwrap();
        assert_eq!(decision, ErrorDecision::GiveUp);
    }

    #[test]
    fn test_stop_when_overrides_attempts() {
        let renderer = TemplateRenderer::new();
        let mut policy = policy(5);
        policy.stop_when = Some("error.status == 401".to_string());

        let error = ActionError::dependency("401").with_status(401);
        let decision =
            evaluate_error_retry(&policy, 1, &error, &error_scope(&error), &renderer).unwrap();
        assert_eq!(decision, ErrorDecision::GiveUp);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..50 {
            let jittered = apply_jitter(10.0, 0.5);
            assert!((5.0..=15.0).contains(&jittered));
        }
    }

    fn pagination_policy() -> PaginationPolicy {
        PaginationPolicy {
            while_expr: "response.paging.hasMore".to_string(),
            max_attempts: 10,
            next_call: Some(serde_json::json!({
                "params": {"page": "{{ response.paging.page + 1 }}"}
            })),
            collect: CollectSpec {
                strategy: CollectStrategy::Append,
                path: "data".to_string(),
                into: "items".to_string(),
            },
        }
    }

    fn page(n: i64, has_more: bool, data: Vec<i64>) -> Value {
        serde_json::json!({"data": data, "paging": {"page": n, "hasMore": has_more}})
    }

    fn response_scope(response: &Value) -> HashMap<String, Value> {
        let mut scope = HashMap::new();
        scope.insert("response".to_string(), response.clone());
        scope
    }

    #[test]
    fn test_pagination_continue_and_finish() {
        let renderer = TemplateRenderer::new();
        let policy = pagination_policy();

        let first = page(1, true, vec![1, 2, 3]);
        let decision =
            evaluate_pagination(&policy, 1, &response_scope(&first), &renderer).unwrap();
        assert_eq!(decision, PageDecision::Continue { next_attempt: 2 });

        let last = page(4, false, vec![31]);
        let decision =
            evaluate_pagination(&policy, 4, &response_scope(&last), &renderer).unwrap();
        assert_eq!(decision, PageDecision::Finish);
    }

    #[test]
    fn test_pagination_max_attempts_bound() {
        let renderer = TemplateRenderer::new();
        let mut policy = pagination_policy();
        policy.max_attempts = 2;

        let still_more = page(2, true, vec![4]);
        let decision =
            evaluate_pagination(&policy, 2, &response_scope(&still_more), &renderer).unwrap();
        assert_eq!(decision, PageDecision::Finish);
    }

    #[test]
    fn test_next_call_rewrite() {
        let renderer = TemplateRenderer::new();
        let policy = pagination_policy();
        let prev_args = serde_json::json!({
            "url": "https://api.example.com/list",
            "params": {"page": 1, "size": 10}
        });

        let response = page(1, true, vec![1]);
        let next = next_call_args(&policy, &prev_args, &response_scope(&response), &renderer)
            .unwrap();

        assert_eq!(next["url"], "https://api.example.com/list");
        assert_eq!(next["params"]["page"], 2);
        assert_eq!(next["params"]["size"], 10);
    }

    #[test]
    fn test_append_preserves_page_order() {
        let policy = pagination_policy();
        let pages = vec![
            page(1, true, vec![1, 2]),
            page(2, true, vec![3, 4]),
            page(3, false, vec![5]),
        ];
        let result = finalize_paginated_result(&policy.collect, &pages);
        assert_eq!(result["items"], serde_json::json!([1, 2, 3, 4, 5]));
        // Final page fields remain visible
        assert_eq!(result["paging"]["page"], 3);
    }

    #[test]
    fn test_merge_strategy() {
        let collect = CollectSpec {
            strategy: CollectStrategy::Merge,
            path: "data".to_string(),
            into: "merged".to_string(),
        };
        let pages = vec![
            serde_json::json!({"data": {"a": 1, "b": 1}}),
            serde_json::json!({"data": {"b": 2, "c": 3}}),
        ];
        let buffer = aggregate_pages(&collect, &pages);
        assert_eq!(buffer, serde_json::json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn test_replace_strategy() {
        let collect = CollectSpec {
            strategy: CollectStrategy::Replace,
            path: "data".to_string(),
            into: "last".to_string(),
        };
        let pages = vec![
            serde_json::json!({"data": [1]}),
            serde_json::json!({"data": [9]}),
        ];
        assert_eq!(aggregate_pages(&collect, &pages), serde_json::json!([9]));
    }

    #[test]
    fn test_json_path() {
        let value = serde_json::json!({"a": {"b": [{"c": 7}]}});
        assert_eq!(json_path(&value, "a.b.0.c"), Some(&serde_json::json!(7)));
        assert_eq!(json_path(&value, "a.missing"), None);
    }
}
