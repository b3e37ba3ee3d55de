//! Event model for execution event sourcing.
//!
//! Every state transition of an execution is an immutable event. The event
//! log is the source of truth; all workflow state is derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ActionError, CoreError};

/// Closed set of event types for workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Execution submitted, workload recorded.
    PlaybookStarted,
    /// Step entered.
    StepStarted,
    /// Worker began a tool invocation.
    ActionStarted,
    /// Tool invocation produced a success envelope.
    ActionCompleted,
    /// Tool invocation produced an error envelope.
    ActionFailed,
    /// Step finished successfully, result attached.
    StepCompleted,
    /// Step finished with an unrecovered error.
    StepFailed,
    /// Loop opened, collection snapshot recorded.
    IteratorStarted,
    /// One loop iteration finished (success or collected error).
    IterationCompleted,
    /// All loop iterations accounted for, aggregate attached.
    IteratorCompleted,
    /// Error-side retry decided, next attempt delayed.
    RetryScheduled,
    /// Success-side pagination decided, next call recorded.
    PaginationContinued,
    /// Sink side-effect finished.
    SinkCompleted,
    /// Sink side-effect failed.
    SinkFailed,
    /// Child execution submitted.
    ChildStarted,
    /// Child execution reached a terminal state.
    ChildCompleted,
    /// Terminal: every live branch reached `end`.
    PlaybookCompleted,
    /// Terminal: execution failed or was cancelled.
    PlaybookFailed,
}

impl EventType {
    /// Whether this event type terminates an execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::PlaybookCompleted | EventType::PlaybookFailed)
    }

    /// Wire name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::PlaybookStarted => "playbook_started",
            EventType::StepStarted => "step_started",
            EventType::ActionStarted => "action_started",
            EventType::ActionCompleted => "action_completed",
            EventType::ActionFailed => "action_failed",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::IteratorStarted => "iterator_started",
            EventType::IterationCompleted => "iteration_completed",
            EventType::IteratorCompleted => "iterator_completed",
            EventType::RetryScheduled => "retry_scheduled",
            EventType::PaginationContinued => "pagination_continued",
            EventType::SinkCompleted => "sink_completed",
            EventType::SinkFailed => "sink_failed",
            EventType::ChildStarted => "child_started",
            EventType::ChildCompleted => "child_completed",
            EventType::PlaybookCompleted => "playbook_completed",
            EventType::PlaybookFailed => "playbook_failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "playbook_started" => Ok(EventType::PlaybookStarted),
            "step_started" => Ok(EventType::StepStarted),
            "action_started" => Ok(EventType::ActionStarted),
            "action_completed" => Ok(EventType::ActionCompleted),
            "action_failed" => Ok(EventType::ActionFailed),
            "step_completed" => Ok(EventType::StepCompleted),
            "step_failed" => Ok(EventType::StepFailed),
            "iterator_started" => Ok(EventType::IteratorStarted),
            "iteration_completed" => Ok(EventType::IterationCompleted),
            "iterator_completed" => Ok(EventType::IteratorCompleted),
            "retry_scheduled" => Ok(EventType::RetryScheduled),
            "pagination_continued" => Ok(EventType::PaginationContinued),
            "sink_completed" => Ok(EventType::SinkCompleted),
            "sink_failed" => Ok(EventType::SinkFailed),
            "child_started" => Ok(EventType::ChildStarted),
            "child_completed" => Ok(EventType::ChildCompleted),
            "playbook_completed" => Ok(EventType::PlaybookCompleted),
            "playbook_failed" => Ok(EventType::PlaybookFailed),
            other => Err(CoreError::Validation(format!(
                "Unknown event type: {}",
                other
            ))),
        }
    }
}

/// Event status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Started,
    Running,
    Completed,
    Failed,
    Cancelled,
    Pending,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Started => "STARTED",
            EventStatus::Running => "RUNNING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Cancelled => "CANCELLED",
            EventStatus::Pending => "PENDING",
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for EventStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "STARTED" => EventStatus::Started,
            "RUNNING" => EventStatus::Running,
            "COMPLETED" => EventStatus::Completed,
            "FAILED" => EventStatus::Failed,
            "CANCELLED" => EventStatus::Cancelled,
            _ => EventStatus::Pending,
        }
    }
}

/// Immutable event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Execution this event belongs to.
    pub execution_id: i64,

    /// Dense, strictly increasing sequence number within the execution.
    pub event_id: i64,

    /// Step name the event refers to. Iteration-level events keep the
    /// iterator step name here and carry the index in the payload.
    pub node_id: Option<String>,

    /// Causal parent (e.g. iteration results point at their iterator).
    pub parent_event_id: Option<i64>,

    /// Event type.
    pub event_type: EventType,

    /// Event status.
    pub status: EventStatus,

    /// Structured payload. Sanitized before storage.
    pub payload: serde_json::Value,

    /// Structured error for failure events.
    pub error: Option<ActionError>,

    /// Worker that produced the event, if any.
    pub worker_id: Option<String>,

    /// Attempt number for action-scoped events.
    pub attempt: Option<i32>,

    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// Event waiting to be appended; the log assigns `event_id` and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub execution_id: i64,
    pub node_id: Option<String>,
    pub parent_event_id: Option<i64>,
    pub event_type: EventType,
    pub status: EventStatus,
    pub payload: serde_json::Value,
    pub error: Option<ActionError>,
    pub worker_id: Option<String>,
    pub attempt: Option<i32>,
}

impl EventDraft {
    /// Create a draft with a status derived from the event type.
    pub fn new(execution_id: i64, event_type: EventType) -> Self {
        let status = match event_type {
            EventType::PlaybookStarted | EventType::StepStarted | EventType::ChildStarted => {
                EventStatus::Started
            }
            EventType::ActionStarted => EventStatus::Running,
            EventType::ActionFailed
            | EventType::StepFailed
            | EventType::SinkFailed
            | EventType::PlaybookFailed => EventStatus::Failed,
            EventType::RetryScheduled | EventType::PaginationContinued => EventStatus::Pending,
            EventType::IteratorStarted => EventStatus::Running,
            _ => EventStatus::Completed,
        };

        Self {
            execution_id,
            node_id: None,
            parent_event_id: None,
            event_type,
            status,
            payload: serde_json::Value::Null,
            error: None,
            worker_id: None,
            attempt: None,
        }
    }

    /// Set the step name.
    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the causal parent event.
    pub fn parent(mut self, parent_event_id: i64) -> Self {
        self.parent_event_id = Some(parent_event_id);
        self
    }

    /// Set the payload.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the structured error.
    pub fn error(mut self, error: ActionError) -> Self {
        self.error = Some(error);
        self
    }

    /// Set the status explicitly.
    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the worker id.
    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Set the attempt number.
    pub fn attempt(mut self, attempt: i32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_event_type_roundtrip() {
        let all = [
            EventType::PlaybookStarted,
            EventType::StepStarted,
            EventType::ActionStarted,
            EventType::ActionCompleted,
            EventType::ActionFailed,
            EventType::StepCompleted,
            EventType::StepFailed,
            EventType::IteratorStarted,
            EventType::IterationCompleted,
            EventType::IteratorCompleted,
            EventType::RetryScheduled,
            EventType::PaginationContinued,
            EventType::SinkCompleted,
            EventType::SinkFailed,
            EventType::ChildStarted,
            EventType::ChildCompleted,
            EventType::PlaybookCompleted,
            EventType::PlaybookFailed,
        ];
        for ty in all {
            assert_eq!(EventType::from_str(ty.as_str()).unwrap(), ty);
        }
    }

    #[test]
    fn test_event_type_serde_matches_wire_name() {
        let json = serde_json::to_value(EventType::IterationCompleted).unwrap();
        assert_eq!(json, serde_json::json!("iteration_completed"));
    }

    #[test]
    fn test_terminal_types() {
        assert!(EventType::PlaybookCompleted.is_terminal());
        assert!(EventType::PlaybookFailed.is_terminal());
        assert!(!EventType::StepCompleted.is_terminal());
    }

    #[test]
    fn test_draft_default_status() {
        let draft = EventDraft::new(1, EventType::StepFailed);
        assert_eq!(draft.status, EventStatus::Failed);

        let draft = EventDraft::new(1, EventType::ActionStarted);
        assert_eq!(draft.status, EventStatus::Running);

        let draft = EventDraft::new(1, EventType::StepCompleted);
        assert_eq!(draft.status, EventStatus::Completed);
    }

    #[test]
    fn test_draft_builder() {
        let draft = EventDraft::new(42, EventType::IterationCompleted)
            .node("fanout")
            .parent(7)
            .payload(serde_json::json!({"index": 2, "result": {"v": 1}}))
            .attempt(1);

        assert_eq!(draft.node_id.as_deref(), Some("fanout"));
        assert_eq!(draft.parent_event_id, Some(7));
        assert_eq!(draft.payload["index"], 2);
        assert_eq!(draft.attempt, Some(1));
    }
}
