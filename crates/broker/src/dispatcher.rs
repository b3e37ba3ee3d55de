//! The broker dispatch loop.
//!
//! Polls for executions whose event head moved past the broker cursor,
//! claims the per-execution broker slot, and processes the new events in
//! order: fold the prefix, decide, apply, advance. Exactly one broker
//! handles a given execution at a time; the slot lease hands over on expiry.

use std::sync::Arc;
use std::time::Duration;

use floe_core::engine::orchestrator::Orchestrator;
use floe_core::engine::state::{ExecutionState, WorkflowState};
use floe_core::error::ActionError;
use floe_core::event::{Event, EventDraft, EventType};
use floe_core::playbook::{self, types::Playbook, END_STEP};
use floe_store::{BrokerState, EventLog, PlaybookCatalog, StoreError, WorkQueue};

use crate::config::BrokerConfig;
use crate::driver::Driver;
use crate::error::AppResult;
use crate::submission::Store;

/// Per-process broker dispatcher.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    driver: Driver,
    orchestrator: Orchestrator,
    config: BrokerConfig,
    broker_id: String,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(store: Arc<dyn Store>, config: BrokerConfig) -> Self {
        let driver = Driver::new(store.clone());
        Self {
            store,
            driver,
            orchestrator: Orchestrator::new(),
            config,
            broker_id: format!("broker-{}", uuid::Uuid::new_v4()),
        }
    }

    /// This dispatcher's identity for slot leases.
    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    /// Run the dispatch loop until the future is dropped.
    pub async fn run(&self) {
        tracing::info!(broker_id = %self.broker_id, "Dispatcher started");

        loop {
            match self.poll_once().await {
                Ok(0) => {
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "Dispatcher poll failed");
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }
    }

    /// One poll: pick up dirty executions and process them. Returns the
    /// number of executions handled.
    pub async fn poll_once(&self) -> AppResult<usize> {
        let dirty = self.store.dirty_executions(self.config.dirty_limit).await?;
        let count = dirty.len();

        for execution_id in dirty {
            if let Err(err) = self.process_execution(execution_id).await {
                tracing::error!(execution_id, error = %err, "Execution processing failed");
            }
        }

        Ok(count)
    }

    /// Drain all pending work. Test harness entry point.
    pub async fn run_until_quiescent(&self) -> AppResult<()> {
        loop {
            if self.poll_once().await? == 0 {
                return Ok(());
            }
        }
    }

    /// Process every event past the cursor for one execution, under the
    /// broker slot lease.
    pub async fn process_execution(&self, execution_id: i64) -> AppResult<()> {
        if !self
            .store
            .claim(execution_id, &self.broker_id, self.config.claim_ttl())
            .await?
        {
            tracing::debug!(execution_id, "Broker slot held elsewhere");
            return Ok(());
        }

        let result = self.drive(execution_id).await;

        self.store
            .release(execution_id, &self.broker_id)
            .await
            .ok();
        result
    }

    async fn drive(&self, execution_id: i64) -> AppResult<()> {
        let events = self.store.range(execution_id, None).await?;
        if events.is_empty() {
            return Ok(());
        }

        let playbook = match self.load_playbook(&events).await? {
            Some(playbook) => playbook,
            None => {
                // Nothing to orchestrate against; terminate the execution.
                self.fail_unloadable(execution_id, &events).await?;
                return Ok(());
            }
        };

        loop {
            let cursor = self.store.cursor(execution_id).await?;
            let events = self.store.range(execution_id, None).await?;

            let trigger = match events.iter().find(|e| e.event_id > cursor) {
                Some(trigger) => trigger.clone(),
                None => break,
            };

            // Snapshot folded through the trigger, nothing beyond it.
            let mut state = WorkflowState::new(execution_id);
            for event in events.iter().filter(|e| e.event_id <= trigger.event_id) {
                state.apply_event(event);
            }

            match self.orchestrator.decide(&state, &trigger, &playbook) {
                Ok(decision) => {
                    self.driver.apply(execution_id, decision).await?;
                }
                Err(err) => {
                    // A broken decision must not wedge the execution; log
                    // and move past the event.
                    tracing::error!(
                        execution_id,
                        event_id = trigger.event_id,
                        event_type = %trigger.event_type,
                        error = %err,
                        "Decision failed"
                    );
                }
            }

            if trigger.event_type.is_terminal() {
                self.join_parent(execution_id, &state).await?;
            }

            self.store
                .advance_cursor(execution_id, trigger.event_id)
                .await?;
        }

        Ok(())
    }

    /// Load and parse the playbook referenced by `playbook_started`.
    async fn load_playbook(&self, events: &[Event]) -> AppResult<Option<Playbook>> {
        let started = match events
            .iter()
            .find(|e| e.event_type == EventType::PlaybookStarted)
        {
            Some(started) => started,
            None => return Ok(None),
        };

        let path = match started.payload.get("path").and_then(|v| v.as_str()) {
            Some(path) => path,
            None => return Ok(None),
        };
        let version = started
            .payload
            .get("version")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let entry = match self.store.fetch(path, version).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        match playbook::parse(&entry.content) {
            Ok(playbook) => Ok(Some(playbook)),
            Err(err) => {
                tracing::error!(path, error = %err, "Registered playbook is invalid");
                Ok(None)
            }
        }
    }

    async fn fail_unloadable(&self, execution_id: i64, events: &[Event]) -> AppResult<()> {
        let head = events.last().map(|e| e.event_id).unwrap_or(0);
        let error = ActionError::validation("Playbook could not be loaded for execution");

        let draft = EventDraft::new(execution_id, EventType::PlaybookFailed)
            .error(error.clone())
            .payload(serde_json::json!({
                "cause": {
                    "step": "",
                    "kind": error.kind,
                    "message": error.message,
                    "attempts": 0,
                }
            }));
        match self.store.append(draft).await {
            Ok(event_id) => {
                self.store.kill_execution(execution_id).await?;
                self.store.advance_cursor(execution_id, event_id).await?;
            }
            Err(StoreError::TerminalRecorded(_)) => {
                self.store.advance_cursor(execution_id, head).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Emit `child_completed` on the parent when a child reached terminal
    /// state. The supervisor observes the child via the event log only.
    async fn join_parent(&self, execution_id: i64, state: &WorkflowState) -> AppResult<()> {
        let (parent_id, parent_step) = match self.store.parent(execution_id).await? {
            Some(parent) => parent,
            None => return Ok(()),
        };

        // Idempotence across crash-replay: skip when the parent already saw
        // this child's completion.
        let parent_events = self.store.range(parent_id, None).await?;
        let already_joined = parent_events.iter().any(|e| {
            e.event_type == EventType::ChildCompleted
                && e.payload.get("child_execution_id").and_then(|v| v.as_i64())
                    == Some(execution_id)
        });
        if already_joined {
            return Ok(());
        }

        let result = state
            .get_step_result(END_STEP)
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let draft = match state.state {
            ExecutionState::Completed => {
                EventDraft::new(parent_id, EventType::ChildCompleted)
                    .node(&parent_step)
                    .payload(serde_json::json!({
                        "child_execution_id": execution_id,
                        "status": "completed",
                        "result": result,
                    }))
            }
            _ => {
                let error = match (&state.cause, state.state) {
                    (_, ExecutionState::Cancelled) => {
                        ActionError::cancelled("child execution cancelled")
                    }
                    (Some(cause), _) => ActionError::new(
                        cause.kind,
                        format!("child step '{}' failed: {}", cause.step, cause.message),
                    ),
                    (None, _) => ActionError::dependency("child execution failed"),
                };
                EventDraft::new(parent_id, EventType::ChildCompleted)
                    .node(&parent_step)
                    .payload(serde_json::json!({
                        "child_execution_id": execution_id,
                        "status": "failed",
                    }))
                    .error(error)
            }
        };

        match self.store.append(draft).await {
            Ok(_) => {
                tracing::info!(
                    child_execution_id = execution_id,
                    parent_execution_id = parent_id,
                    step = %parent_step,
                    "Child joined to parent"
                );
                Ok(())
            }
            Err(StoreError::TerminalRecorded(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Background sweep: return expired leases to the queue.
pub async fn reap_loop(store: Arc<dyn Store>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match store.reap().await {
            Ok(0) => {}
            Ok(reclaimed) => {
                tracing::info!(reclaimed, "Requeued expired leases");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Reap sweep failed");
            }
        }
    }
}
