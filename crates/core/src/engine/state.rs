//! Execution state reconstruction from events.
//!
//! The reconstructor folds the event log of one execution into a snapshot.
//! It is pure and deterministic: identical event prefixes yield identical
//! snapshots, which is what makes the broker restart-safe. Loop and
//! pagination state is rebuilt from event payloads, never carried in memory
//! across decisions.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ActionError, ErrorKind};
use crate::event::{Event, EventType};
use crate::job::parse_node_id;
use crate::playbook::types::{FailPolicy, LoopMode};

/// High-level execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// No events yet.
    Initial,
    /// Execution is in progress.
    InProgress,
    /// Execution completed successfully.
    Completed,
    /// Execution failed.
    Failed,
    /// Execution was cancelled.
    Cancelled,
}

impl ExecutionState {
    /// Whether the execution reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionState::Initial => "initial",
            ExecutionState::InProgress => "in_progress",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// State of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Known but not entered.
    Pending,
    /// Entered (`step_started`).
    Started,
    /// Work in flight: action running, loop open, sink or child pending.
    Running,
    /// Waiting out a retry delay.
    Retrying,
    /// Finished successfully.
    Completed,
    /// Finished with an unrecovered error.
    Failed,
    /// Rendered moot by a terminal event while still in flight.
    Skipped,
}

impl StepState {
    /// Whether the step still produces events.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            StepState::Started | StepState::Running | StepState::Retrying
        )
    }
}

/// Per-step snapshot entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub name: String,
    pub state: StepState,

    /// Final step result (`step_completed` payload).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Last unrecovered error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,

    /// Highest attempt number observed on action events.
    pub attempts: i32,

    /// Successful action results in completion order. Pagination pages
    /// accumulate here; child results land here too.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_results: Vec<serde_json::Value>,

    /// Latest pagination rewrite recorded for the step; retries of a page
    /// re-issue these arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_page_args: Option<serde_json::Value>,

    /// Child execution id for child_playbook steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_execution_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entered_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepInfo {
    /// New entry in pending state.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: StepState::Pending,
            result: None,
            error: None,
            attempts: 0,
            action_results: Vec::new(),
            last_page_args: None,
            child_execution_id: None,
            entered_at: None,
            completed_at: None,
        }
    }

    /// Latest successful action result.
    pub fn last_action_result(&self) -> Option<&serde_json::Value> {
        self.action_results.last()
    }
}

/// Server-side state of an active loop, rebuilt from events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorFrame {
    pub step: String,
    pub element: String,
    pub mode: LoopMode,
    pub fail_policy: FailPolicy,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,

    /// Collection snapshot taken at `iterator_started`.
    pub items: Vec<serde_json::Value>,

    /// Event id of the opening `iterator_started`.
    pub started_event_id: i64,

    /// Successful results by iteration index.
    pub results: BTreeMap<usize, serde_json::Value>,

    /// Collected errors by iteration index (collect_errors policy).
    pub errors: BTreeMap<usize, serde_json::Value>,

    /// Whether `iterator_completed` was observed.
    pub closed: bool,
}

impl IteratorFrame {
    /// Number of iterations that settled (result or collected error).
    pub fn settled_count(&self) -> usize {
        self.results.len() + self.errors.len()
    }

    /// Whether every iteration settled.
    pub fn is_settled(&self) -> bool {
        self.settled_count() >= self.total
    }

    /// Whether a given index settled.
    pub fn is_index_settled(&self, index: usize) -> bool {
        self.results.contains_key(&index) || self.errors.contains_key(&index)
    }

    /// Lowest index that has not settled yet.
    pub fn next_unsettled(&self) -> Option<usize> {
        (0..self.total).find(|i| !self.is_index_settled(*i))
    }

    /// Aggregate results as a list indexed by iteration index. Collected
    /// errors appear as `{"error": ...}` entries.
    pub fn aggregated(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = (0..self.total)
            .map(|i| {
                if let Some(result) = self.results.get(&i) {
                    result.clone()
                } else if let Some(error) = self.errors.get(&i) {
                    serde_json::json!({ "error": error })
                } else {
                    serde_json::Value::Null
                }
            })
            .collect();
        serde_json::Value::Array(entries)
    }
}

/// Terminal cause chain carried on `playbook_failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCause {
    pub step: String,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: i32,
}

/// Complete workflow state reconstructed from events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub execution_id: i64,
    pub state: ExecutionState,

    /// Per-step state, ordered by name for determinism.
    pub steps: BTreeMap<String, StepInfo>,

    /// Open and closed loop frames by step name.
    pub iterators: BTreeMap<String, IteratorFrame>,

    /// Failed steps whose failure branch was taken.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub handled_failures: BTreeSet<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_step: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Cause chain of the terminal failure, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
}

impl WorkflowState {
    /// Empty state for an execution.
    pub fn new(execution_id: i64) -> Self {
        Self {
            execution_id,
            state: ExecutionState::Initial,
            steps: BTreeMap::new(),
            iterators: BTreeMap::new(),
            handled_failures: BTreeSet::new(),
            workload: None,
            path: None,
            version: None,
            parent_execution_id: None,
            parent_step: None,
            started_at: None,
            completed_at: None,
            cause: None,
        }
    }

    /// Reconstruct workflow state from an ordered event slice.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let mut state = Self::new(first.execution_id);

        for event in events {
            state.apply_event(event);
        }

        Some(state)
    }

    fn step_entry(&mut self, name: &str) -> &mut StepInfo {
        self.steps
            .entry(name.to_string())
            .or_insert_with(|| StepInfo::new(name))
    }

    /// Apply a single event.
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::PlaybookStarted => {
                self.state = ExecutionState::InProgress;
                self.started_at = Some(event.created_at);
                self.workload = event.payload.get("workload").cloned();
                self.path = event
                    .payload
                    .get("path")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                self.version = event
                    .payload
                    .get("version")
                    .and_then(|v| v.as_i64())
                    .map(|v| v as i32);
                self.parent_execution_id =
                    event.payload.get("parent_execution_id").and_then(|v| v.as_i64());
                self.parent_step = event
                    .payload
                    .get("parent_step")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
            }
            EventType::StepStarted => {
                if let Some(name) = &event.node_id {
                    if let Some(failed) = event.payload.get("on_failure_of").and_then(|v| v.as_str())
                    {
                        self.handled_failures.insert(failed.to_string());
                    }
                    let created_at = event.created_at;
                    let name = name.clone();
                    let step = self.step_entry(&name);
                    if step.state == StepState::Pending {
                        step.state = StepState::Started;
                    }
                    step.entered_at.get_or_insert(created_at);
                }
            }
            EventType::ActionStarted => {
                if let Some(node) = &event.node_id {
                    let (name, _) = parse_node_id(node);
                    let attempt = event.attempt.unwrap_or(1);
                    let name = name.to_string();
                    let step = self.step_entry(&name);
                    if !matches!(step.state, StepState::Completed | StepState::Failed) {
                        step.state = StepState::Running;
                    }
                    step.attempts = step.attempts.max(attempt);
                }
            }
            EventType::ActionCompleted => {
                if let Some(node) = &event.node_id {
                    let (name, index) = parse_node_id(node);
                    if index.is_none() {
                        let result = event
                            .payload
                            .get("result")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        let name = name.to_string();
                        self.step_entry(&name).action_results.push(result);
                    }
                }
            }
            EventType::ActionFailed => {
                if let Some(node) = &event.node_id {
                    let (name, index) = parse_node_id(node);
                    if index.is_none() {
                        let error = event.error.clone();
                        let name = name.to_string();
                        self.step_entry(&name).error = error;
                    }
                }
            }
            EventType::RetryScheduled => {
                if let Some(node) = &event.node_id {
                    let (name, index) = parse_node_id(node);
                    if index.is_none() {
                        let name = name.to_string();
                        let step = self.step_entry(&name);
                        if step.state.is_live() {
                            step.state = StepState::Retrying;
                        }
                    }
                }
            }
            EventType::PaginationContinued => {
                if let Some(name) = &event.node_id {
                    let args = event.payload.get("args").cloned();
                    let name = name.clone();
                    self.step_entry(&name).last_page_args = args;
                }
            }
            EventType::IteratorStarted => {
                if let Some(name) = &event.node_id {
                    let payload = &event.payload;
                    let items = payload
                        .get("items")
                        .and_then(|v| v.as_array())
                        .cloned()
                        .unwrap_or_default();
                    let frame = IteratorFrame {
                        step: name.clone(),
                        element: payload
                            .get("element")
                            .and_then(|v| v.as_str())
                            .unwrap_or("item")
                            .to_string(),
                        mode: payload
                            .get("mode")
                            .and_then(|v| serde_json::from_value(v.clone()).ok())
                            .unwrap_or_default(),
                        fail_policy: payload
                            .get("fail_policy")
                            .and_then(|v| serde_json::from_value(v.clone()).ok())
                            .unwrap_or_default(),
                        total: payload
                            .get("total")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(items.len() as u64) as usize,
                        chunk: payload
                            .get("chunk")
                            .and_then(|v| v.as_u64())
                            .map(|v| v as usize),
                        items,
                        started_event_id: event.event_id,
                        results: BTreeMap::new(),
                        errors: BTreeMap::new(),
                        closed: false,
                    };
                    self.iterators.insert(name.clone(), frame);
                    let name = name.clone();
                    let step = self.step_entry(&name);
                    if !matches!(step.state, StepState::Completed | StepState::Failed) {
                        step.state = StepState::Running;
                    }
                }
            }
            EventType::IterationCompleted => {
                if let Some(name) = &event.node_id {
                    if let Some(frame) = self.iterators.get_mut(name) {
                        if let Some(index) =
                            event.payload.get("index").and_then(|v| v.as_u64())
                        {
                            let index = index as usize;
                            if let Some(error) = event.payload.get("error") {
                                frame.errors.insert(index, error.clone());
                            } else {
                                let result = event
                                    .payload
                                    .get("result")
                                    .cloned()
                                    .unwrap_or(serde_json::Value::Null);
                                frame.results.insert(index, result);
                            }
                        }
                    }
                }
            }
            EventType::IteratorCompleted => {
                if let Some(name) = &event.node_id {
                    if let Some(frame) = self.iterators.get_mut(name) {
                        frame.closed = true;
                    }
                }
            }
            EventType::StepCompleted => {
                if let Some(name) = &event.node_id {
                    let result = event
                        .payload
                        .get("result")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    let created_at = event.created_at;
                    let name = name.clone();
                    let step = self.step_entry(&name);
                    step.state = StepState::Completed;
                    step.result = Some(result);
                    step.completed_at = Some(created_at);
                }
            }
            EventType::StepFailed => {
                if let Some(name) = &event.node_id {
                    let error = event.error.clone();
                    let created_at = event.created_at;
                    let name = name.clone();
                    let step = self.step_entry(&name);
                    step.state = StepState::Failed;
                    step.error = error;
                    step.completed_at = Some(created_at);
                }
            }
            EventType::SinkCompleted | EventType::SinkFailed => {}
            EventType::ChildStarted => {
                if let Some(name) = &event.node_id {
                    let child = event
                        .payload
                        .get("child_execution_id")
                        .and_then(|v| v.as_i64());
                    let name = name.clone();
                    let step = self.step_entry(&name);
                    step.child_execution_id = child;
                    if !matches!(step.state, StepState::Completed | StepState::Failed) {
                        step.state = StepState::Running;
                    }
                }
            }
            EventType::ChildCompleted => {
                if let Some(name) = &event.node_id {
                    if event.error.is_none() {
                        let result = event
                            .payload
                            .get("result")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        let name = name.clone();
                        self.step_entry(&name).action_results.push(result);
                    }
                }
            }
            EventType::PlaybookCompleted => {
                self.state = ExecutionState::Completed;
                self.completed_at = Some(event.created_at);
            }
            EventType::PlaybookFailed => {
                let cancelled = event
                    .error
                    .as_ref()
                    .map(|e| e.kind == ErrorKind::Cancelled)
                    .unwrap_or(false);
                self.state = if cancelled {
                    ExecutionState::Cancelled
                } else {
                    ExecutionState::Failed
                };
                self.completed_at = Some(event.created_at);
                self.cause = event
                    .payload
                    .get("cause")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());

                // In-flight steps will never complete now.
                for step in self.steps.values_mut() {
                    if step.state.is_live() {
                        step.state = StepState::Skipped;
                    }
                }
            }
        }
    }

    /// Results of completed steps, addressed by step name.
    pub fn step_results(&self) -> HashMap<String, serde_json::Value> {
        self.steps
            .iter()
            .filter(|(_, info)| info.state == StepState::Completed)
            .filter_map(|(name, info)| info.result.clone().map(|r| (name.clone(), r)))
            .collect()
    }

    /// Result of a single step, when completed.
    pub fn get_step_result(&self, name: &str) -> Option<&serde_json::Value> {
        self.steps.get(name).and_then(|s| s.result.as_ref())
    }

    /// Whether a step completed successfully.
    pub fn is_step_completed(&self, name: &str) -> bool {
        self.steps
            .get(name)
            .map(|s| s.state == StepState::Completed)
            .unwrap_or(false)
    }

    /// Whether a step finished (successfully or not).
    pub fn is_step_done(&self, name: &str) -> bool {
        self.steps
            .get(name)
            .map(|s| {
                matches!(
                    s.state,
                    StepState::Completed | StepState::Failed | StepState::Skipped
                )
            })
            .unwrap_or(false)
    }

    /// Whether a step was entered at all.
    pub fn is_step_known(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Names of steps that still produce events.
    pub fn live_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, info)| info.state.is_live())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Whether any step still produces events.
    pub fn has_live_work(&self) -> bool {
        self.steps.values().any(|info| info.state.is_live())
    }

    /// Steps that failed, in name order.
    pub fn failed_steps(&self) -> Vec<&StepInfo> {
        self.steps
            .values()
            .filter(|info| info.state == StepState::Failed)
            .collect()
    }
}
