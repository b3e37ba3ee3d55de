//! Queue job construction.
//!
//! Builds the durable jobs the broker hands to workers: regular actions,
//! loop iterations, pagination continuations, and sink side-effects. Args
//! stay templated here; the worker renders them over the job context after
//! resolving credentials. Pagination jobs carry pre-merged concrete args.

use serde_json::Value;

use crate::context::Scope;
use crate::error::CoreResult;
use crate::job::{
    iteration_node_id, sink_node_id, IterationMeta, JobDraft, JobKind, TaskSpec, ToolCall,
};
use crate::playbook::types::{SinkSpec, Step};

/// Default lease budget before a row is dead-lettered.
const DEFAULT_LEASE_ATTEMPTS: i32 = 5;

/// Builder for queue job drafts.
#[derive(Debug, Default)]
pub struct CommandBuilder;

impl CommandBuilder {
    /// Create a new command builder.
    pub fn new() -> Self {
        Self
    }

    /// Regular action job for a step.
    pub fn action_job(
        &self,
        execution_id: i64,
        step: &Step,
        scope: &Scope,
        attempt: i32,
        delay: f64,
    ) -> CoreResult<JobDraft> {
        let tool = step.tool_spec();
        let mut task = TaskSpec::new(ToolCall {
            kind: tool.kind,
            args: step.args.clone().unwrap_or(Value::Null),
        });
        task.timeout = tool.timeout;
        task.auth = tool.auth.clone();

        Ok(JobDraft::new(execution_id, &step.step, &task)
            .attempt(attempt)
            .delay(delay)
            .context(scope.to_context_value())
            .priority(0)
            .max_attempts(DEFAULT_LEASE_ATTEMPTS))
    }

    /// Loop iteration job. The scope must already carry the element binding.
    pub fn iteration_job(
        &self,
        execution_id: i64,
        step: &Step,
        scope: &Scope,
        iteration: IterationMeta,
        attempt: i32,
        delay: f64,
    ) -> CoreResult<JobDraft> {
        let tool = step.tool_spec();
        let node_id = iteration_node_id(&step.step, iteration.index);

        let mut task = TaskSpec::new(ToolCall {
            kind: tool.kind,
            args: step.args.clone().unwrap_or(Value::Null),
        });
        task.timeout = tool.timeout;
        task.auth = tool.auth.clone();
        task.iteration = Some(iteration);

        Ok(JobDraft::new(execution_id, node_id, &task)
            .attempt(attempt)
            .delay(delay)
            .context(scope.to_context_value())
            .max_attempts(DEFAULT_LEASE_ATTEMPTS))
    }

    /// Pagination continuation: same step, next attempt, concrete args.
    pub fn pagination_job(
        &self,
        execution_id: i64,
        step: &Step,
        scope: &Scope,
        next_args: Value,
        attempt: i32,
    ) -> CoreResult<JobDraft> {
        let tool = step.tool_spec();
        let mut task = TaskSpec::new(ToolCall {
            kind: tool.kind,
            args: step.args.clone().unwrap_or(Value::Null),
        });
        task.timeout = tool.timeout;
        task.auth = tool.auth.clone();
        task.args_override = Some(next_args);

        Ok(JobDraft::new(execution_id, &step.step, &task)
            .attempt(attempt)
            .context(scope.to_context_value())
            .max_attempts(DEFAULT_LEASE_ATTEMPTS))
    }

    /// Sink side-effect job. The scope must carry `result`.
    pub fn sink_job(
        &self,
        execution_id: i64,
        step: &Step,
        sink: &SinkSpec,
        scope: &Scope,
    ) -> CoreResult<JobDraft> {
        let mut task = TaskSpec::new(ToolCall {
            kind: sink.tool.kind,
            args: sink.args.clone().unwrap_or(Value::Null),
        });
        task.timeout = sink.tool.timeout;
        task.auth = sink.tool.auth.clone();

        Ok(JobDraft::new(execution_id, sink_node_id(&step.step), &task)
            .kind(JobKind::Sink)
            .context(scope.to_context_value())
            .max_attempts(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::types::{SinkFailurePolicy, ToolKind, ToolSpec};

    fn make_step() -> Step {
        Step {
            step: "fetch".to_string(),
            desc: None,
            tool: Some(ToolSpec {
                kind: ToolKind::Http,
                auth: None,
                timeout: Some(30),
                path: None,
                version: None,
            }),
            args: Some(serde_json::json!({"url": "https://{{ workload.host }}/api"})),
            r#loop: None,
            retry: None,
            sink: None,
            next: vec![],
        }
    }

    #[test]
    fn test_action_job() {
        let builder = CommandBuilder::new();
        let scope = Scope::new()
            .with_workload(&serde_json::json!({"host": "example.com"}))
            .with_execution_id(7);

        let draft = builder.action_job(7, &make_step(), &scope, 1, 0.0).unwrap();
        assert_eq!(draft.node_id, "fetch");
        assert_eq!(draft.attempt, 1);
        assert_eq!(draft.kind, JobKind::Action);

        let task: TaskSpec = serde_json::from_value(draft.action).unwrap();
        assert_eq!(task.tool.kind, ToolKind::Http);
        assert_eq!(task.timeout, Some(30));
        // Args stay templated; the worker renders them.
        assert_eq!(task.tool.args["url"], "https://{{ workload.host }}/api");
        assert_eq!(draft.context["workload"]["host"], "example.com");
    }

    #[test]
    fn test_iteration_job_node_id() {
        let builder = CommandBuilder::new();
        let scope = Scope::new().with_item("item", &serde_json::json!("x"), 2, 5);
        let iteration = IterationMeta {
            step: "fetch".to_string(),
            index: 2,
            total: 5,
            element: "item".to_string(),
            item: serde_json::json!("x"),
            parent_event_id: 11,
        };

        let draft = builder
            .iteration_job(7, &make_step(), &scope, iteration, 1, 0.0)
            .unwrap();
        assert_eq!(draft.node_id, "fetch[2]");

        let task: TaskSpec = serde_json::from_value(draft.action).unwrap();
        let meta = task.iteration.unwrap();
        assert_eq!(meta.index, 2);
        assert_eq!(meta.parent_event_id, 11);
    }

    #[test]
    fn test_pagination_job_overrides() {
        let builder = CommandBuilder::new();
        let scope = Scope::new();
        let next_args = serde_json::json!({"url": "https://example.com", "params": {"page": 2}});

        let draft = builder
            .pagination_job(7, &make_step(), &scope, next_args.clone(), 2)
            .unwrap();
        assert_eq!(draft.attempt, 2);

        let task: TaskSpec = serde_json::from_value(draft.action).unwrap();
        assert_eq!(task.args_override, Some(next_args));
    }

    #[test]
    fn test_sink_job() {
        let builder = CommandBuilder::new();
        let sink = SinkSpec {
            when: None,
            tool: ToolSpec {
                kind: ToolKind::File,
                auth: None,
                timeout: None,
                path: None,
                version: None,
            },
            args: Some(serde_json::json!({"path": "/tmp/out.jsonl"})),
            policy: SinkFailurePolicy::Warn,
        };
        let scope = Scope::new().with_result(&serde_json::json!({"rows": 3}));

        let draft = builder.sink_job(7, &make_step(), &sink, &scope).unwrap();
        assert_eq!(draft.node_id, "fetch~sink");
        assert_eq!(draft.kind, JobKind::Sink);
        assert_eq!(draft.max_attempts, 1);
        assert_eq!(draft.context["result"]["rows"], 3);
    }
}
