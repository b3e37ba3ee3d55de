//! End-to-end orchestration scenarios.
//!
//! Each test runs the real dispatcher and the real worker job processor
//! against the in-memory store, with scripted executors standing in for
//! the outside world. Assertions follow the user-visible event timeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use floe_broker::{BrokerConfig, Dispatcher, SubmitRequest};
use floe_core::engine::state::{ExecutionState, WorkflowState};
use floe_core::error::{ActionError, ErrorKind};
use floe_core::event::{Event, EventType};
use floe_core::job::JobStatus;
use floe_core::playbook::types::ToolKind;
use floe_store::{MemoryStore, PlaybookCatalog, WorkQueue};
use floe_tools::{Tool, ToolContext, ToolError, ToolRegistry, ToolResult};
use floe_worker::{JobProcessor, WorkerConfig};

// ---------------------------------------------------------------------
// Scripted executors
// ---------------------------------------------------------------------

/// Echoes its rendered args as the result. Registered under `http` so
/// steps exercise the full queue/worker path.
struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Http
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::success(args.clone()))
    }
}

/// Fails with a 503 for the first `fail_times` calls, then succeeds.
struct FlakyTool {
    calls: AtomicUsize,
    fail_times: usize,
}

#[async_trait]
impl Tool for FlakyTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Http
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            Ok(ToolResult::failure(
                ActionError::dependency("upstream unavailable").with_status(503),
            ))
        } else {
            Ok(ToolResult::success(args.clone()))
        }
    }
}

/// Serves 4 pages of a paged listing: 10 + 10 + 10 + 5 items.
struct PagedTool;

#[async_trait]
impl Tool for PagedTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Http
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let page = args
            .get("params")
            .and_then(|p| p.get("page"))
            .and_then(|v| v.as_i64())
            .unwrap_or(1);

        let (start, count) = match page {
            1 => (1, 10),
            2 => (11, 10),
            3 => (21, 10),
            _ => (31, 5),
        };
        let data: Vec<i64> = (start..start + count).collect();

        Ok(ToolResult::success(serde_json::json!({
            "data": data,
            "paging": {"page": page, "hasMore": page < 4}
        })))
    }
}

/// Fails exactly one iteration index, succeeds elsewhere.
struct FailIndexTool {
    fail_index: i64,
}

#[async_trait]
impl Tool for FailIndexTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Http
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let index = args.get("index").and_then(|v| v.as_i64()).unwrap_or(-1);
        if index == self.fail_index {
            Ok(ToolResult::failure(
                ActionError::dependency(format!("element {} exploded", index)).with_status(500),
            ))
        } else {
            Ok(ToolResult::success(serde_json::json!({"index": index})))
        }
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    dispatcher: Dispatcher,
    processor: JobProcessor,
    batch: i64,
}

impl Harness {
    fn new<T: Tool + 'static>(scripted: T) -> Self {
        let mut registry = ToolRegistry::new();
        registry.register(scripted);
        Self::with_registry(registry)
    }

    fn with_registry(registry: ToolRegistry) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(store.clone(), BrokerConfig::default());

        let mut worker_config = WorkerConfig::default();
        worker_config.worker_id = "test-worker".to_string();
        let processor = JobProcessor::new(
            worker_config,
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(registry),
        );

        Self {
            store,
            dispatcher,
            processor,
            batch: 10,
        }
    }

    async fn register(&self, path: &str, yaml: &str) {
        self.store.register(path, yaml).await.unwrap();
    }

    async fn submit(&self, path: &str, payload: serde_json::Value) -> i64 {
        let request = SubmitRequest {
            path: path.to_string(),
            version: None,
            payload: Some(payload),
        };
        floe_broker::submit(self.store.as_ref(), &request, None)
            .await
            .unwrap()
    }

    /// Alternate broker and worker turns until the execution terminates.
    async fn run_to_completion(&self, execution_id: i64) -> WorkflowState {
        for _ in 0..500 {
            self.dispatcher.run_until_quiescent().await.unwrap();

            let state =
                WorkflowState::from_events(&self.store.events_for(execution_id)).unwrap();
            if state.state.is_terminal() {
                // Flush trailing decisions (kill sets, child joins).
                self.dispatcher.run_until_quiescent().await.unwrap();
                return state;
            }

            let jobs = self
                .store
                .lease("test-worker", self.batch, Duration::from_secs(30))
                .await
                .unwrap();

            if jobs.is_empty() {
                let waiting = self
                    .store
                    .all_jobs()
                    .iter()
                    .any(|j| j.status == JobStatus::Queued);
                if waiting {
                    // Retry/pagination delay has not elapsed yet.
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }

            for job in jobs {
                self.processor.process(job).await;
            }
        }

        panic!("execution {} did not reach a terminal state", execution_id);
    }

    fn events(&self, execution_id: i64) -> Vec<Event> {
        self.store.events_for(execution_id)
    }
}

fn timeline(events: &[Event]) -> Vec<(EventType, Option<String>)> {
    events
        .iter()
        .map(|e| (e.event_type, e.node_id.clone()))
        .collect()
}

fn count(events: &[Event], event_type: EventType) -> usize {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

// ---------------------------------------------------------------------
// S1 - linear three-step success
// ---------------------------------------------------------------------

const LINEAR: &str = r#"
apiVersion: floe.dev/v1
kind: Playbook
metadata:
  name: linear
  path: test/linear
workflow:
  - step: start
    next:
      - when: "true"
        then: [a]
  - step: a
    tool:
      kind: http
    args:
      v: 1
    next:
      - when: "true"
        then: [b]
  - step: b
    tool:
      kind: http
    args:
      v: 2
    next:
      - when: "true"
        then: [end]
  - step: end
"#;

#[tokio::test]
async fn s1_linear_three_step_success() {
    let harness = Harness::new(EchoTool);
    harness.register("test/linear", LINEAR).await;

    let execution_id = harness.submit("test/linear", serde_json::json!({})).await;
    let state = harness.run_to_completion(execution_id).await;

    assert_eq!(state.state, ExecutionState::Completed);
    assert_eq!(state.get_step_result("a"), Some(&serde_json::json!({"v": 1})));
    assert_eq!(state.get_step_result("b"), Some(&serde_json::json!({"v": 2})));

    let events = harness.events(execution_id);
    let expected: Vec<(EventType, Option<String>)> = vec![
        (EventType::PlaybookStarted, None),
        (EventType::StepStarted, Some("start".into())),
        (EventType::StepCompleted, Some("start".into())),
        (EventType::StepStarted, Some("a".into())),
        (EventType::ActionStarted, Some("a".into())),
        (EventType::ActionCompleted, Some("a".into())),
        (EventType::StepCompleted, Some("a".into())),
        (EventType::StepStarted, Some("b".into())),
        (EventType::ActionStarted, Some("b".into())),
        (EventType::ActionCompleted, Some("b".into())),
        (EventType::StepCompleted, Some("b".into())),
        (EventType::StepStarted, Some("end".into())),
        (EventType::StepCompleted, Some("end".into())),
        (EventType::PlaybookCompleted, None),
    ];
    assert_eq!(timeline(&events), expected);

    // Ordering invariants: dense ids, non-decreasing timestamps, terminal
    // event last and unique.
    for pair in events.windows(2) {
        assert_eq!(pair[1].event_id, pair[0].event_id + 1);
        assert!(pair[1].created_at >= pair[0].created_at);
    }
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type.is_terminal())
            .count(),
        1
    );
    assert!(events.last().unwrap().event_type.is_terminal());
}

// ---------------------------------------------------------------------
// S2 - error-side retry succeeds on the third attempt
// ---------------------------------------------------------------------

const RETRY: &str = r#"
apiVersion: floe.dev/v1
kind: Playbook
metadata:
  name: retry
  path: test/retry
workflow:
  - step: start
    next:
      - when: "true"
        then: [a]
  - step: a
    tool:
      kind: http
    args:
      v: 1
    retry:
      on_error:
        when: "error.status == 503"
        max_attempts: 3
        initial_delay: 0.2
        multiplier: 2
    next:
      - when: "true"
        then: [end]
  - step: end
"#;

#[tokio::test]
async fn s2_retry_succeeds_on_third_attempt() {
    let harness = Harness::new(FlakyTool {
        calls: AtomicUsize::new(0),
        fail_times: 2,
    });
    harness.register("test/retry", RETRY).await;

    let execution_id = harness.submit("test/retry", serde_json::json!({})).await;
    let state = harness.run_to_completion(execution_id).await;
    assert_eq!(state.state, ExecutionState::Completed);

    let events = harness.events(execution_id);

    // Two scheduled retries with exponential delays.
    let retries: Vec<&Event> = events
        .iter()
        .filter(|e| e.event_type == EventType::RetryScheduled)
        .collect();
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].payload["delay"], 0.2);
    assert_eq!(retries[0].payload["next_attempt"], 2);
    assert_eq!(retries[1].payload["delay"], 0.4);
    assert_eq!(retries[1].payload["next_attempt"], 3);

    // Attempts line up one-to-one with action_started events.
    let starts: Vec<i32> = events
        .iter()
        .filter(|e| e.event_type == EventType::ActionStarted)
        .map(|e| e.attempt.unwrap())
        .collect();
    assert_eq!(starts, vec![1, 2, 3]);
    assert_eq!(count(&events, EventType::ActionFailed), 2);
    assert_eq!(count(&events, EventType::ActionCompleted), 1);

    // One queue row per logical attempt, each leased exactly once.
    let mut rows: Vec<(i32, i32)> = harness
        .store
        .all_jobs()
        .iter()
        .filter(|j| j.node_id == "a")
        .map(|j| (j.attempt, j.attempts))
        .collect();
    rows.sort_unstable();
    assert_eq!(rows, vec![(1, 1), (2, 1), (3, 1)]);
}

// ---------------------------------------------------------------------
// S3 - success-side pagination with append
// ---------------------------------------------------------------------

const PAGED: &str = r#"
apiVersion: floe.dev/v1
kind: Playbook
metadata:
  name: paged
  path: test/paged
workflow:
  - step: start
    next:
      - when: "true"
        then: [fetch]
  - step: fetch
    tool:
      kind: http
    args:
      url: "https://api.example.com/items"
      params:
        page: 1
    retry:
      on_success:
        while: "response.paging.hasMore"
        max_attempts: 10
        next_call:
          params:
            page: "{{ response.paging.page + 1 }}"
        collect:
          strategy: append
          path: data
          into: items
    next:
      - when: "true"
        then: [end]
  - step: end
"#;

#[tokio::test]
async fn s3_pagination_appends_all_pages() {
    let harness = Harness::new(PagedTool);
    harness.register("test/paged", PAGED).await;

    let execution_id = harness.submit("test/paged", serde_json::json!({})).await;
    let state = harness.run_to_completion(execution_id).await;
    assert_eq!(state.state, ExecutionState::Completed);

    let events = harness.events(execution_id);
    assert_eq!(count(&events, EventType::PaginationContinued), 3);
    assert_eq!(count(&events, EventType::ActionCompleted), 4);

    let result = state.get_step_result("fetch").unwrap();
    let items = result["items"].as_array().unwrap();
    assert_eq!(items.len(), 35);
    // Append preserves page order.
    assert_eq!(items[0], serde_json::json!(1));
    assert_eq!(items[34], serde_json::json!(35));
    // The final page's own fields stay visible.
    assert_eq!(result["paging"]["hasMore"], false);
}

// ---------------------------------------------------------------------
// S4 - sequential loop over three items
// ---------------------------------------------------------------------

const SEQ_LOOP: &str = r#"
apiVersion: floe.dev/v1
kind: Playbook
metadata:
  name: seq-loop
  path: test/seq-loop
workflow:
  - step: start
    next:
      - when: "true"
        then: [fanout]
  - step: fanout
    tool:
      kind: http
    args:
      item: "{{ element }}"
    loop:
      in: "{{ workload.items }}"
      element: element
      mode: sequential
    next:
      - when: "true"
        then: [end]
  - step: end
"#;

#[tokio::test]
async fn s4_sequential_loop_in_order() {
    let harness = Harness::new(EchoTool);
    harness.register("test/seq-loop", SEQ_LOOP).await;

    let execution_id = harness
        .submit(
            "test/seq-loop",
            serde_json::json!({"items": ["x", "y", "z"]}),
        )
        .await;
    let state = harness.run_to_completion(execution_id).await;
    assert_eq!(state.state, ExecutionState::Completed);

    let events = harness.events(execution_id);

    let opened: Vec<&Event> = events
        .iter()
        .filter(|e| e.event_type == EventType::IteratorStarted)
        .collect();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].payload["total"], 3);

    // Sequential dispatch: iterations settle in index order.
    let indexes: Vec<i64> = events
        .iter()
        .filter(|e| e.event_type == EventType::IterationCompleted)
        .map(|e| e.payload["index"].as_i64().unwrap())
        .collect();
    assert_eq!(indexes, vec![0, 1, 2]);

    // Iteration results attribute to the iterator via parent_event_id.
    let iterator_event_id = opened[0].event_id;
    for event in events
        .iter()
        .filter(|e| e.event_type == EventType::IterationCompleted)
    {
        assert_eq!(event.parent_event_id, Some(iterator_event_id));
    }

    assert_eq!(count(&events, EventType::IteratorCompleted), 1);
    assert_eq!(
        state.get_step_result("fanout"),
        Some(&serde_json::json!([
            {"item": "x"},
            {"item": "y"},
            {"item": "z"}
        ]))
    );
}

// ---------------------------------------------------------------------
// S5 - parallel loop, one failure, fail_fast
// ---------------------------------------------------------------------

const PAR_LOOP: &str = r#"
apiVersion: floe.dev/v1
kind: Playbook
metadata:
  name: par-loop
  path: test/par-loop
workflow:
  - step: start
    next:
      - when: "true"
        then: [fanout]
  - step: fanout
    tool:
      kind: http
    args:
      index: "{{ _index }}"
    loop:
      in: "{{ workload.items }}"
      element: element
      mode: parallel
      fail_policy: fail_fast
    next:
      - when: "true"
        then: [end]
  - step: end
"#;

#[tokio::test]
async fn s5_parallel_loop_fail_fast() {
    let mut harness = Harness::new(FailIndexTool { fail_index: 1 });
    harness.register("test/par-loop", PAR_LOOP).await;
    // One job per turn so the failure lands while a sibling is still queued.
    harness.batch = 1;

    let execution_id = harness
        .submit("test/par-loop", serde_json::json!({"items": ["a", "b", "c"]}))
        .await;
    let state = harness.run_to_completion(execution_id).await;

    assert_eq!(state.state, ExecutionState::Failed);

    let events = harness.events(execution_id);
    assert_eq!(count(&events, EventType::IteratorCompleted), 0);

    let failed = events
        .iter()
        .find(|e| e.event_type == EventType::StepFailed)
        .unwrap();
    assert_eq!(failed.node_id.as_deref(), Some("fanout"));
    assert!(failed.error.as_ref().unwrap().message.contains("iteration 1"));

    let cause = state.cause.as_ref().unwrap();
    assert_eq!(cause.step, "fanout");
    assert_eq!(cause.kind, ErrorKind::Dependency);

    // The not-yet-leased iteration was cancelled.
    let dead: Vec<String> = harness
        .store
        .all_jobs()
        .iter()
        .filter(|j| j.status == JobStatus::Dead)
        .map(|j| j.node_id.clone())
        .collect();
    assert_eq!(dead, vec!["fanout[2]".to_string()]);
}

// ---------------------------------------------------------------------
// S6 - child playbook composition
// ---------------------------------------------------------------------

const PARENT: &str = r#"
apiVersion: floe.dev/v1
kind: Playbook
metadata:
  name: parent
  path: test/parent
workflow:
  - step: start
    next:
      - when: "true"
        then: [run_child]
  - step: run_child
    tool:
      kind: child_playbook
      path: test/child
    args:
      who: "{{ workload.who }}"
    next:
      - when: "true"
        then: [end]
  - step: end
"#;

const CHILD: &str = r#"
apiVersion: floe.dev/v1
kind: Playbook
metadata:
  name: child
  path: test/child
workflow:
  - step: start
    next:
      - when: "true"
        then: [greet]
  - step: greet
    tool:
      kind: http
    args:
      greeting: "hello {{ workload.who }}"
    next:
      - when: "true"
        then: [end]
  - step: end
    args:
      message: "{{ greet.greeting }}"
"#;

#[tokio::test]
async fn s6_child_playbook_composition() {
    let harness = Harness::new(EchoTool);
    harness.register("test/parent", PARENT).await;
    harness.register("test/child", CHILD).await;

    let parent_id = harness
        .submit("test/parent", serde_json::json!({"who": "floe"}))
        .await;
    let state = harness.run_to_completion(parent_id).await;
    assert_eq!(state.state, ExecutionState::Completed);

    let parent_events = harness.events(parent_id);
    let child_started = parent_events
        .iter()
        .find(|e| e.event_type == EventType::ChildStarted)
        .unwrap();
    let child_id = child_started.payload["child_execution_id"].as_i64().unwrap();
    assert_ne!(child_id, parent_id);

    // Parent timeline around the child step.
    let kinds: Vec<(EventType, Option<&str>)> = parent_events
        .iter()
        .filter(|e| e.node_id.as_deref() == Some("run_child"))
        .map(|e| (e.event_type, e.node_id.as_deref()))
        .collect();
    assert_eq!(
        kinds.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        vec![
            EventType::StepStarted,
            EventType::ActionStarted,
            EventType::ChildStarted,
            EventType::ChildCompleted,
            EventType::StepCompleted,
        ]
    );

    // Child output (its end-step mapping) becomes the parent step result.
    assert_eq!(
        state.get_step_result("run_child"),
        Some(&serde_json::json!({"message": "hello floe"}))
    );

    // The child ran as a full, independent execution.
    let child_events = harness.events(child_id);
    let child_state = WorkflowState::from_events(&child_events).unwrap();
    assert_eq!(child_state.state, ExecutionState::Completed);
    assert_eq!(child_state.parent_execution_id, Some(parent_id));
    assert_eq!(child_events[0].event_type, EventType::PlaybookStarted);
    assert!(child_events.last().unwrap().event_type.is_terminal());
    assert_eq!(
        child_state.get_step_result("greet"),
        Some(&serde_json::json!({"greeting": "hello floe"}))
    );
}

// ---------------------------------------------------------------------
// Conditional routing and failure handling
// ---------------------------------------------------------------------

const BRANCHING: &str = r#"
apiVersion: floe.dev/v1
kind: Playbook
metadata:
  name: branching
  path: test/branching
workflow:
  - step: start
    next:
      - when: "true"
        then: [probe]
  - step: probe
    tool:
      kind: http
    args:
      score: "{{ workload.score }}"
    next:
      - when: "result.score > 10"
        then: [high]
      - else: [low]
  - step: high
    tool:
      kind: http
    args:
      route: high
    next:
      - when: "true"
        then: [end]
  - step: low
    tool:
      kind: http
    args:
      route: low
    next:
      - when: "true"
        then: [end]
  - step: end
"#;

#[tokio::test]
async fn branching_first_match_and_else() {
    let harness = Harness::new(EchoTool);
    harness.register("test/branching", BRANCHING).await;

    let execution_id = harness
        .submit("test/branching", serde_json::json!({"score": 42}))
        .await;
    let state = harness.run_to_completion(execution_id).await;
    assert!(state.is_step_completed("high"));
    assert!(!state.steps.contains_key("low"));

    let execution_id = harness
        .submit("test/branching", serde_json::json!({"score": 3}))
        .await;
    let state = harness.run_to_completion(execution_id).await;
    assert!(state.is_step_completed("low"));
    assert!(!state.steps.contains_key("high"));
}

const RECOVERY: &str = r#"
apiVersion: floe.dev/v1
kind: Playbook
metadata:
  name: recovery
  path: test/recovery
workflow:
  - step: start
    next:
      - when: "true"
        then: [shaky]
  - step: shaky
    tool:
      kind: http
    args:
      index: 1
    next:
      - when: "failed"
        then: [fallback]
      - else: [end]
  - step: fallback
    tool:
      kind: http
    args:
      recovered: true
    next:
      - when: "true"
        then: [end]
  - step: end
"#;

#[tokio::test]
async fn failure_branch_recovers_execution() {
    // FailIndexTool fails the `shaky` step (args.index == 1), the failure
    // branch routes to `fallback`, and the execution still completes.
    let harness = Harness::new(FailIndexTool { fail_index: 1 });
    harness.register("test/recovery", RECOVERY).await;

    let execution_id = harness.submit("test/recovery", serde_json::json!({})).await;
    let state = harness.run_to_completion(execution_id).await;

    assert_eq!(state.state, ExecutionState::Completed);
    assert!(state.handled_failures.contains("shaky"));
    assert!(state.is_step_completed("fallback"));

    let events = harness.events(execution_id);
    assert_eq!(count(&events, EventType::StepFailed), 1);
    assert_eq!(count(&events, EventType::PlaybookCompleted), 1);
}

// ---------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------

#[tokio::test]
async fn cancellation_kills_queued_jobs() {
    let harness = Harness::new(EchoTool);
    harness.register("test/linear", LINEAR).await;

    let execution_id = harness.submit("test/linear", serde_json::json!({})).await;

    // Let the broker issue the first job, then cancel before any worker turn.
    harness.dispatcher.run_until_quiescent().await.unwrap();
    floe_broker::cancel(harness.store.as_ref(), execution_id)
        .await
        .unwrap();
    harness.dispatcher.run_until_quiescent().await.unwrap();

    let state = WorkflowState::from_events(&harness.events(execution_id)).unwrap();
    assert_eq!(state.state, ExecutionState::Cancelled);
    assert_eq!(
        state.cause, None,
        "cancellation carries the error, not a step cause"
    );

    let queued = harness
        .store
        .all_jobs()
        .iter()
        .filter(|j| j.status == JobStatus::Queued)
        .count();
    assert_eq!(queued, 0);
}
