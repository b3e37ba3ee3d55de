//! Durable work queue row model.
//!
//! A job is the unit of dispatch: created by the broker, leased by exactly
//! one worker at a time, completed or failed, re-enqueued as a fresh attempt
//! row by the retry controller, or dead-lettered. The uniqueness key
//! `(execution_id, node_id, attempt)` makes broker re-decisions idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::playbook::types::ToolKind;

/// Queue row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Leased,
    Completed,
    Failed,
    Dead,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Leased => "leased",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "leased" => Ok(JobStatus::Leased),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(CoreError::Validation(format!(
                "Unknown job status: {}",
                other
            ))),
        }
    }
}

/// What the worker should emit for the job's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Regular tool invocation: `action_started` + `action_completed|failed`
    /// (or `iteration_completed` when iteration metadata is present).
    #[default]
    Action,
    /// Sink side-effect: `sink_completed|sink_failed`, no start event.
    Sink,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Action => "action",
            JobKind::Sink => "sink",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "action" => Ok(JobKind::Action),
            "sink" => Ok(JobKind::Sink),
            other => Err(CoreError::Validation(format!(
                "Unknown job kind: {}",
                other
            ))),
        }
    }
}

/// Concrete tool invocation carried inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool type.
    pub kind: ToolKind,

    /// Templated arguments; the worker renders them over the job context.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Iteration metadata attached to loop iteration jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMeta {
    /// Iterator step name.
    pub step: String,

    /// Zero-based iteration index.
    pub index: usize,

    /// Total number of iterations.
    pub total: usize,

    /// Variable name the element is bound to.
    pub element: String,

    /// The element value itself.
    pub item: serde_json::Value,

    /// Event id of the `iterator_started` event this iteration belongs to.
    pub parent_event_id: i64,
}

/// Serialized task stored in the queue row's `action` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Tool invocation.
    pub tool: ToolCall,

    /// Hard deadline for a single attempt, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Credential aliases: scope alias -> credential key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HashMap<String, String>>,

    /// Fully rendered arguments that bypass template rendering. Used by
    /// pagination rewrites where the broker already merged the next call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_override: Option<serde_json::Value>,

    /// Iteration metadata for loop iteration jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationMeta>,
}

impl TaskSpec {
    /// Create a plain task for a tool call.
    pub fn new(tool: ToolCall) -> Self {
        Self {
            tool,
            timeout: None,
            auth: None,
            args_override: None,
            iteration: None,
        }
    }
}

/// Durable queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Queue row identifier.
    pub queue_id: i64,

    /// Execution this job belongs to.
    pub execution_id: i64,

    /// Step name, suffixed for iterations (`step[3]`) and sinks (`step~sink`).
    pub node_id: String,

    /// Outcome event family.
    pub kind: JobKind,

    /// Logical attempt number; part of the uniqueness key.
    pub attempt: i32,

    /// Serialized `TaskSpec`.
    pub action: serde_json::Value,

    /// Serialized scope the worker renders templates over.
    pub context: serde_json::Value,

    /// Row status.
    pub status: JobStatus,

    /// Number of times the row was leased. Grows on lost-lease redelivery.
    pub attempts: i32,

    /// Lease budget before the row is dead-lettered.
    pub max_attempts: i32,

    /// Priority band; higher dispatches first.
    pub priority: i32,

    /// Earliest dispatch time.
    pub available_at: DateTime<Utc>,

    /// Lease expiry when leased.
    pub lease_deadline: Option<DateTime<Utc>>,

    /// Holder of the current lease.
    pub worker_id: Option<String>,
}

impl Job {
    /// Deserialize the task spec from the action column.
    pub fn task(&self) -> Result<TaskSpec, CoreError> {
        Ok(serde_json::from_value(self.action.clone())?)
    }
}

/// Job waiting to be enqueued; the queue assigns `queue_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDraft {
    pub execution_id: i64,
    pub node_id: String,
    pub kind: JobKind,
    pub attempt: i32,
    pub action: serde_json::Value,
    pub context: serde_json::Value,
    pub max_attempts: i32,
    pub priority: i32,
    /// Delay before the job becomes leasable, in seconds.
    pub delay: f64,
}

impl JobDraft {
    /// Create a first-attempt action job draft.
    pub fn new(execution_id: i64, node_id: impl Into<String>, task: &TaskSpec) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            kind: JobKind::Action,
            attempt: 1,
            action: serde_json::to_value(task).unwrap_or(serde_json::Value::Null),
            context: serde_json::Value::Null,
            max_attempts: 3,
            priority: 0,
            delay: 0.0,
        }
    }

    /// Set the scope context.
    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Set the logical attempt number.
    pub fn attempt(mut self, attempt: i32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Set the job kind.
    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the dispatch delay in seconds.
    pub fn delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Set the priority band.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the lease budget.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Node id for a loop iteration job.
pub fn iteration_node_id(step: &str, index: usize) -> String {
    format!("{}[{}]", step, index)
}

/// Node id for a sink job.
pub fn sink_node_id(step: &str) -> String {
    format!("{}~sink", step)
}

/// Split a node id back into step name and iteration index.
pub fn parse_node_id(node_id: &str) -> (&str, Option<usize>) {
    if let Some(open) = node_id.rfind('[') {
        if node_id.ends_with(']') {
            if let Ok(index) = node_id[open + 1..node_id.len() - 1].parse() {
                return (&node_id[..open], Some(index));
            }
        }
    }
    (node_id, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Leased,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Dead,
        ] {
            assert_eq!(JobStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn test_node_id_helpers() {
        assert_eq!(iteration_node_id("fanout", 3), "fanout[3]");
        assert_eq!(sink_node_id("load"), "load~sink");

        assert_eq!(parse_node_id("fanout[3]"), ("fanout", Some(3)));
        assert_eq!(parse_node_id("plain"), ("plain", None));
        assert_eq!(parse_node_id("load~sink"), ("load~sink", None));
        assert_eq!(parse_node_id("odd[name"), ("odd[name", None));
    }

    #[test]
    fn test_task_spec_roundtrip() {
        let task = TaskSpec {
            tool: ToolCall {
                kind: ToolKind::Http,
                args: serde_json::json!({"url": "https://{{ host }}/api"}),
            },
            timeout: Some(30),
            auth: None,
            args_override: None,
            iteration: Some(IterationMeta {
                step: "fanout".to_string(),
                index: 2,
                total: 5,
                element: "item".to_string(),
                item: serde_json::json!("x"),
                parent_event_id: 9,
            }),
        };

        let value = serde_json::to_value(&task).unwrap();
        let back: TaskSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_job_draft_builder() {
        let task = TaskSpec::new(ToolCall {
            kind: ToolKind::Noop,
            args: serde_json::Value::Null,
        });
        let draft = JobDraft::new(7, "a", &task)
            .attempt(2)
            .delay(1.5)
            .context(serde_json::json!({"workload": {}}));

        assert_eq!(draft.execution_id, 7);
        assert_eq!(draft.node_id, "a");
        assert_eq!(draft.attempt, 2);
        assert_eq!(draft.delay, 1.5);
        assert_eq!(draft.kind, JobKind::Action);
    }
}
