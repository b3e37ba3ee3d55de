//! Condition evaluation for workflow transitions and loops.
//!
//! Transitions are evaluated in written order: the first `when` that renders
//! true wins and the `else` clause fires when none matched. Loop collections
//! render to a list of elements, optionally filtered per element.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::playbook::types::{Step, Transition};
use crate::template::TemplateRenderer;

/// Evaluator over rendered conditions.
pub struct ConditionEvaluator {
    renderer: TemplateRenderer,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvaluator {
    /// Create a new condition evaluator.
    pub fn new() -> Self {
        Self {
            renderer: TemplateRenderer::new(),
        }
    }

    /// Evaluate a single condition expression.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        scope: &HashMap<String, Value>,
    ) -> CoreResult<bool> {
        self.renderer.evaluate_condition(condition, scope)
    }

    /// Select transition targets for a step.
    ///
    /// Walks `next` in written order; the first matching `when` wins and its
    /// `then` set is returned. The `else` clause is the sentinel when no
    /// `when` matched. No transitions or no match yields an empty set.
    pub fn select_targets(
        &self,
        step: &Step,
        scope: &HashMap<String, Value>,
    ) -> CoreResult<Vec<String>> {
        let mut fallback: Option<&Vec<String>> = None;

        for transition in &step.next {
            match transition {
                Transition::Cond { when, then } => {
                    if self.evaluate_condition(when, scope)? {
                        return Ok(then.clone());
                    }
                }
                Transition::Else { otherwise } => {
                    if fallback.is_none() {
                        fallback = Some(otherwise);
                    }
                }
            }
        }

        Ok(fallback.cloned().unwrap_or_default())
    }

    /// Select failure-handling targets for a failed step.
    ///
    /// Same first-match-wins walk, but restricted to clauses that inspect
    /// the failure (`failed` or `error` in the expression). The `else`
    /// sentinel and plain success routes must not swallow failures.
    pub fn select_failure_targets(
        &self,
        step: &Step,
        scope: &HashMap<String, Value>,
    ) -> CoreResult<Vec<String>> {
        for transition in &step.next {
            if let Transition::Cond { when, then } = transition {
                if !when.contains("failed") && !when.contains("error") {
                    continue;
                }
                if self.evaluate_condition(when, scope)? {
                    return Ok(then.clone());
                }
            }
        }
        Ok(Vec::new())
    }

    /// Render a loop collection expression into its elements.
    ///
    /// Arrays iterate as-is; objects iterate as `{key, value}` pairs;
    /// numbers iterate `0..n`; strings are parsed as JSON arrays or split
    /// on commas/newlines.
    pub fn render_collection(
        &self,
        expr: &str,
        scope: &HashMap<String, Value>,
    ) -> CoreResult<Vec<Value>> {
        let value = self.renderer.render_to_value(expr, scope)?;

        match value {
            Value::Array(arr) => Ok(arr),
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(k, v)| serde_json::json!({"key": k, "value": v}))
                .collect()),
            Value::String(s) => {
                if let Ok(arr) = serde_json::from_str::<Vec<Value>>(&s) {
                    Ok(arr)
                } else {
                    Ok(s.split([',', '\n'])
                        .map(|item| Value::String(item.trim().to_string()))
                        .filter(|v| !v.as_str().unwrap_or("").is_empty())
                        .collect())
                }
            }
            Value::Number(n) => {
                let n = n.as_u64().unwrap_or(0) as usize;
                Ok((0..n).map(|i| serde_json::json!(i)).collect())
            }
            other => Err(CoreError::Validation(format!(
                "Loop collection '{}' did not evaluate to an iterable: {}",
                expr, other
            ))),
        }
    }

    /// Apply a per-element filter to a rendered collection.
    pub fn filter_items(
        &self,
        items: Vec<Value>,
        filter: &str,
        element: &str,
        scope: &HashMap<String, Value>,
    ) -> CoreResult<Vec<Value>> {
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let mut item_scope = scope.clone();
            item_scope.insert(element.to_string(), item.clone());
            if self.evaluate_condition(filter, &item_scope)? {
                kept.push(item);
            }
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::types::{Step, Transition};

    fn make_step(next: Vec<Transition>) -> Step {
        Step {
            step: "router".to_string(),
            desc: None,
            tool: None,
            args: None,
            r#loop: None,
            retry: None,
            sink: None,
            next,
        }
    }

    fn scope_with(key: &str, value: Value) -> HashMap<String, Value> {
        let mut scope = HashMap::new();
        scope.insert(key.to_string(), value);
        scope
    }

    #[test]
    fn test_first_match_wins() {
        let evaluator = ConditionEvaluator::new();
        let step = make_step(vec![
            Transition::Cond {
                when: "v > 10".to_string(),
                then: vec!["high".to_string()],
            },
            Transition::Cond {
                when: "v > 1".to_string(),
                then: vec!["mid".to_string()],
            },
            Transition::Else {
                otherwise: vec!["low".to_string()],
            },
        ]);

        let targets = evaluator
            .select_targets(&step, &scope_with("v", serde_json::json!(5)))
            .unwrap();
        assert_eq!(targets, vec!["mid"]);

        let targets = evaluator
            .select_targets(&step, &scope_with("v", serde_json::json!(50)))
            .unwrap();
        assert_eq!(targets, vec!["high"]);
    }

    #[test]
    fn test_else_sentinel() {
        let evaluator = ConditionEvaluator::new();
        let step = make_step(vec![
            Transition::Cond {
                when: "v > 10".to_string(),
                then: vec!["high".to_string()],
            },
            Transition::Else {
                otherwise: vec!["low".to_string()],
            },
        ]);

        let targets = evaluator
            .select_targets(&step, &scope_with("v", serde_json::json!(1)))
            .unwrap();
        assert_eq!(targets, vec!["low"]);
    }

    #[test]
    fn test_no_match_no_else() {
        let evaluator = ConditionEvaluator::new();
        let step = make_step(vec![Transition::Cond {
            when: "v > 10".to_string(),
            then: vec!["high".to_string()],
        }]);

        let targets = evaluator
            .select_targets(&step, &scope_with("v", serde_json::json!(1)))
            .unwrap();
        assert!(targets.is_empty());
    }

    #[test]
    fn test_failure_branch_via_failed_flag() {
        let evaluator = ConditionEvaluator::new();
        let step = make_step(vec![
            Transition::Cond {
                when: "failed".to_string(),
                then: vec!["recover".to_string()],
            },
            Transition::Else {
                otherwise: vec!["next".to_string()],
            },
        ]);

        let targets = evaluator
            .select_targets(&step, &scope_with("failed", serde_json::json!(true)))
            .unwrap();
        assert_eq!(targets, vec!["recover"]);

        let targets = evaluator
            .select_targets(&step, &scope_with("failed", serde_json::json!(false)))
            .unwrap();
        assert_eq!(targets, vec!["next"]);
    }

    #[test]
    fn test_render_collection_array() {
        let evaluator = ConditionEvaluator::new();
        let scope = scope_with("items", serde_json::json!(["x", "y", "z"]));
        let items = evaluator.render_collection("{{ items }}", &scope).unwrap();
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_render_collection_number_range() {
        let evaluator = ConditionEvaluator::new();
        let scope = scope_with("n", serde_json::json!(4));
        let items = evaluator.render_collection("{{ n }}", &scope).unwrap();
        assert_eq!(items, vec![
            serde_json::json!(0),
            serde_json::json!(1),
            serde_json::json!(2),
            serde_json::json!(3)
        ]);
    }

    #[test]
    fn test_render_collection_object_pairs() {
        let evaluator = ConditionEvaluator::new();
        let scope = scope_with("m", serde_json::json!({"a": 1}));
        let items = evaluator.render_collection("{{ m }}", &scope).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["key"], "a");
        assert_eq!(items[0]["value"], 1);
    }

    #[test]
    fn test_filter_items() {
        let evaluator = ConditionEvaluator::new();
        let scope = HashMap::new();
        let items = vec![
            serde_json::json!({"v": 1}),
            serde_json::json!({"v": 5}),
            serde_json::json!({"v": 9}),
        ];
        let kept = evaluator
            .filter_items(items, "item.v > 2", "item", &scope)
            .unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0]["v"], 5);
    }
}
