//! Playbook graph types.
//!
//! The in-memory workflow graph the broker consumes: steps, tool specs,
//! loop/retry/sink specs, and conditional transitions. Playbooks are
//! declared in YAML; `parser` loads and validates them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;

/// Supported tool kinds (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Http,
    Sql,
    Code,
    Shell,
    File,
    Noop,
    ChildPlaybook,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolKind::Http => "http",
            ToolKind::Sql => "sql",
            ToolKind::Code => "code",
            ToolKind::Shell => "shell",
            ToolKind::File => "file",
            ToolKind::Noop => "noop",
            ToolKind::ChildPlaybook => "child_playbook",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ToolKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ToolKind::Http),
            "sql" => Ok(ToolKind::Sql),
            "code" => Ok(ToolKind::Code),
            "shell" => Ok(ToolKind::Shell),
            "file" => Ok(ToolKind::File),
            "noop" => Ok(ToolKind::Noop),
            "child_playbook" => Ok(ToolKind::ChildPlaybook),
            other => Err(CoreError::Validation(format!(
                "Unknown tool kind: {}",
                other
            ))),
        }
    }
}

/// Tool specification attached to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool type.
    pub kind: ToolKind,

    /// Credential aliases: scope alias -> credential key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HashMap<String, String>>,

    /// Hard deadline for a single attempt, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Catalog path of the child playbook (child_playbook kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Catalog version of the child playbook (child_playbook kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
}

impl ToolSpec {
    /// A bare noop tool, used for steps declared without a tool.
    pub fn noop() -> Self {
        Self {
            kind: ToolKind::Noop,
            auth: None,
            timeout: None,
            path: None,
            version: None,
        }
    }
}

/// Loop execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Sequential,
    Parallel,
    Chunked,
}

impl std::fmt::Display for LoopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopMode::Sequential => "sequential",
            LoopMode::Parallel => "parallel",
            LoopMode::Chunked => "chunked",
        };
        write!(f, "{}", s)
    }
}

/// Partial-failure policy for loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Abort the iterator and fail the enclosing step on the first error.
    #[default]
    FailFast,
    /// Record errors per index and still complete the iterator.
    CollectErrors,
}

/// Step-level loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Expression producing the collection to iterate over.
    #[serde(rename = "in")]
    pub collection: String,

    /// Variable name the current element is bound to.
    pub element: String,

    /// Execution mode.
    #[serde(default)]
    pub mode: LoopMode,

    /// Window size for chunked mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,

    /// Optional per-element filter expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Partial-failure policy.
    #[serde(default)]
    pub fail_policy: FailPolicy,
}

/// Error-side retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRetryPolicy {
    /// Condition over the scope with `error` bound. Absent matches any
    /// error except cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Maximum attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Delay before the second attempt, in seconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound on any single delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,

    /// Proportional jitter factor in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,

    /// Condition that stops retrying even when attempts remain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_when: Option<String>,
}

fn default_max_attempts() -> i32 {
    3
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    60.0
}

impl Default for ErrorRetryPolicy {
    fn default() -> Self {
        Self {
            when: None,
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            jitter: None,
            stop_when: None,
        }
    }
}

/// Accumulation strategy for pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectStrategy {
    /// Concatenate page slices in page order.
    #[default]
    Append,
    /// Merge page objects key-by-key, later pages win.
    Merge,
    /// Keep only the last page slice.
    Replace,
}

/// What to accumulate across pages and where to put it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectSpec {
    #[serde(default)]
    pub strategy: CollectStrategy,

    /// Dotted path into the response selecting the page slice.
    pub path: String,

    /// Key in the final step result receiving the accumulated buffer.
    pub into: String,
}

/// Success-side retry policy (pagination).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationPolicy {
    /// Condition over the scope with `response` bound; true continues.
    #[serde(rename = "while")]
    pub while_expr: String,

    /// Maximum pages including the first.
    #[serde(default = "default_max_pages")]
    pub max_attempts: i32,

    /// Argument overrides (expressions) rendered atop the previous call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_call: Option<serde_json::Value>,

    /// Accumulation spec.
    pub collect: CollectSpec,
}

fn default_max_pages() -> i32 {
    100
}

/// Retry specification: error side, success side, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorRetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<PaginationPolicy>,
}

/// Sink failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkFailurePolicy {
    /// Log and complete the step anyway.
    #[default]
    Warn,
    /// Fail the step.
    FailStep,
}

/// Conditional persistence side-effect evaluated at step exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    /// Condition over the scope with `result` bound. Absent means always.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Storage tool invoked with the rendered args.
    pub tool: ToolSpec,

    /// Templated arguments for the storage tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,

    /// What a sink failure does to the step.
    #[serde(default)]
    pub policy: SinkFailurePolicy,
}

/// Conditional transition out of a step. Evaluated in written order; the
/// first matching `when` wins, `else` fires when none matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transition {
    Cond {
        when: String,
        then: Vec<String>,
    },
    Else {
        #[serde(rename = "else")]
        otherwise: Vec<String>,
    },
}

/// Workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique identifier).
    pub step: String,

    /// Step description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    /// Tool configuration. Absent means noop (used by `start`/`end`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolSpec>,

    /// Templated arguments passed to the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,

    /// Loop configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#loop: Option<LoopSpec>,

    /// Retry configuration (error side and/or pagination).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    /// Sink configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<SinkSpec>,

    /// Conditional transitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<Transition>,
}

impl Step {
    /// Effective tool spec; steps without one are noops.
    pub fn tool_spec(&self) -> ToolSpec {
        self.tool.clone().unwrap_or_else(ToolSpec::noop)
    }

    /// Effective tool kind.
    pub fn tool_kind(&self) -> ToolKind {
        self.tool.as_ref().map(|t| t.kind).unwrap_or(ToolKind::Noop)
    }

    /// Whether the step carries no work of its own: no real tool, no loop,
    /// no sink. Such steps complete as soon as they start.
    pub fn is_trivial(&self) -> bool {
        self.tool_kind() == ToolKind::Noop && self.r#loop.is_none() && self.sink.is_none()
    }

    /// All transition targets, unconditional of `when` clauses.
    pub fn transition_targets(&self) -> impl Iterator<Item = &str> {
        self.next.iter().flat_map(|t| match t {
            Transition::Cond { then, .. } => then.iter(),
            Transition::Else { otherwise } => otherwise.iter(),
        })
        .map(|s| s.as_str())
    }
}

/// Playbook metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Playbook name (required).
    pub name: String,

    /// Catalog path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Labels for filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Complete playbook definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    /// API version (floe.dev/v1).
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (Playbook).
    pub kind: String,

    /// Metadata (name, path, labels).
    pub metadata: Metadata,

    /// Default workload merged under submitted payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<serde_json::Value>,

    /// Workflow steps.
    pub workflow: Vec<Step>,
}

/// Name of the reserved entry step.
pub const START_STEP: &str = "start";

/// Name of the reserved finalizing step.
pub const END_STEP: &str = "end";

impl Playbook {
    /// Get a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// Whether the workflow declares the reserved start step.
    pub fn has_start_step(&self) -> bool {
        self.get_step(START_STEP).is_some()
    }

    /// All step names in declaration order.
    pub fn step_names(&self) -> Vec<&str> {
        self.workflow.iter().map(|s| s.step.as_str()).collect()
    }

    /// Catalog path.
    pub fn path(&self) -> Option<&str> {
        self.metadata.path.as_deref()
    }

    /// Playbook name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_tool_kind_roundtrip() {
        for kind in [
            ToolKind::Http,
            ToolKind::Sql,
            ToolKind::Code,
            ToolKind::Shell,
            ToolKind::File,
            ToolKind::Noop,
            ToolKind::ChildPlaybook,
        ] {
            assert_eq!(ToolKind::from_str(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn test_transition_deserialization() {
        let yaml = r#"
- when: "{{ result.v > 1 }}"
  then: [high]
- else: [low]
"#;
        let transitions: Vec<Transition> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(transitions.len(), 2);
        assert!(matches!(transitions[0], Transition::Cond { .. }));
        assert!(matches!(transitions[1], Transition::Else { .. }));
    }

    #[test]
    fn test_step_trivial() {
        let step = Step {
            step: "end".to_string(),
            desc: None,
            tool: None,
            args: None,
            r#loop: None,
            retry: None,
            sink: None,
            next: vec![],
        };
        assert!(step.is_trivial());
        assert_eq!(step.tool_kind(), ToolKind::Noop);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy: ErrorRetryPolicy = serde_yaml::from_str("max_attempts: 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, 1.0);
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_delay, 60.0);
        assert!(policy.jitter.is_none());
    }

    #[test]
    fn test_loop_spec_defaults() {
        let spec: LoopSpec = serde_yaml::from_str(
            r#"
in: "{{ workload.items }}"
element: item
"#,
        )
        .unwrap();
        assert_eq!(spec.mode, LoopMode::Sequential);
        assert_eq!(spec.fail_policy, FailPolicy::FailFast);
    }

    #[test]
    fn test_transition_targets() {
        let step = Step {
            step: "router".to_string(),
            desc: None,
            tool: None,
            args: None,
            r#loop: None,
            retry: None,
            sink: None,
            next: vec![
                Transition::Cond {
                    when: "x".to_string(),
                    then: vec!["a".to_string(), "b".to_string()],
                },
                Transition::Else {
                    otherwise: vec!["c".to_string()],
                },
            ],
        };
        let targets: Vec<&str> = step.transition_targets().collect();
        assert_eq!(targets, vec!["a", "b", "c"]);
    }
}
