//! The broker decision core.
//!
//! `Orchestrator::decide` implements the per-event decision procedure: fold
//! state, look at the triggering event, and produce the events to emit, the
//! jobs to enqueue, and the child executions to spawn. It is pure (no I/O)
//! and idempotent under re-delivery: every emission is guarded by snapshot
//! state, and job enqueues are deduplicated by the queue uniqueness key.
//!
//! Recovery-critical side effects follow an events-first pattern: a decision
//! emits the fact (`retry_scheduled`, `pagination_continued`,
//! `iterator_started`) and the jobs are derived when that event is itself
//! processed. A crash between the two replays into the same jobs.

use serde_json::Value;

use crate::context::Scope;
use crate::engine::commands::CommandBuilder;
use crate::engine::evaluator::ConditionEvaluator;
use crate::engine::retry::{self, ErrorDecision, PageDecision};
use crate::engine::state::WorkflowState;
use crate::error::{ActionError, CoreResult, ErrorKind};
use crate::event::{Event, EventDraft, EventType};
use crate::job::{parse_node_id, IterationMeta, JobDraft};
use crate::playbook::types::{
    FailPolicy, LoopMode, Playbook, SinkFailurePolicy, Step, ToolKind, START_STEP,
};
use crate::template::TemplateRenderer;

/// Default window for chunked iterators without an explicit `chunk`.
const DEFAULT_CHUNK: usize = 8;

/// A child execution the driver must submit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSpawn {
    /// Parent step waiting on the child.
    pub step: String,
    /// Catalog path of the child playbook.
    pub path: String,
    /// Catalog version; latest when absent.
    pub version: Option<i32>,
    /// Rendered child workload.
    pub payload: Value,
}

/// Which queued jobs a decision invalidates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KillSet {
    /// Nothing to cancel.
    #[default]
    None,
    /// Pending iteration jobs of one iterator step.
    Iterations(String),
    /// Every queued job of the execution.
    All,
}

/// Output of one decision.
#[derive(Debug, Default)]
pub struct Decision {
    /// Events to append, in order.
    pub events: Vec<EventDraft>,
    /// Jobs to enqueue (idempotent via the queue uniqueness key).
    pub jobs: Vec<JobDraft>,
    /// Child executions to submit.
    pub children: Vec<ChildSpawn>,
    /// Queued jobs to invalidate.
    pub kill: KillSet,
}

impl Decision {
    fn empty() -> Self {
        Self::default()
    }

    /// Whether the decision carries no work at all.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.jobs.is_empty()
            && self.children.is_empty()
            && self.kill == KillSet::None
    }
}

/// Per-execution orchestrator. Stateless between decisions; all state comes
/// from the snapshot.
pub struct Orchestrator {
    evaluator: ConditionEvaluator,
    builder: CommandBuilder,
    renderer: TemplateRenderer,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new() -> Self {
        Self {
            evaluator: ConditionEvaluator::new(),
            builder: CommandBuilder::new(),
            renderer: TemplateRenderer::new(),
        }
    }

    /// Decide what the trigger event implies, given the snapshot folded
    /// through it.
    pub fn decide(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        if snapshot.state.is_terminal() {
            // The terminal event itself invalidates outstanding work; any
            // event observed after it is a no-op.
            if trigger.event_type == EventType::PlaybookFailed {
                return Ok(Decision {
                    kill: KillSet::All,
                    ..Decision::default()
                });
            }
            return Ok(Decision::empty());
        }

        match trigger.event_type {
            EventType::PlaybookStarted => self.on_playbook_started(snapshot, trigger, playbook),
            EventType::StepStarted => self.on_step_started(snapshot, trigger, playbook),
            EventType::IteratorStarted => self.on_iterator_started(snapshot, trigger, playbook),
            EventType::ActionCompleted => self.on_action_completed(snapshot, trigger, playbook),
            EventType::ActionFailed => self.on_action_failed(snapshot, trigger, playbook),
            EventType::RetryScheduled => self.on_retry_scheduled(snapshot, trigger, playbook),
            EventType::PaginationContinued => {
                self.on_pagination_continued(snapshot, trigger, playbook)
            }
            EventType::IterationCompleted => {
                self.on_iteration_completed(snapshot, trigger, playbook)
            }
            EventType::StepCompleted => self.on_step_completed(snapshot, trigger, playbook),
            EventType::StepFailed => self.on_step_failed(snapshot, trigger, playbook),
            EventType::SinkCompleted => self.on_sink_completed(snapshot, trigger, playbook),
            EventType::SinkFailed => self.on_sink_failed(snapshot, trigger, playbook),
            EventType::ChildCompleted => self.on_child_completed(snapshot, trigger, playbook),
            // Progress markers; nothing to decide.
            EventType::ActionStarted
            | EventType::IteratorCompleted
            | EventType::ChildStarted
            | EventType::PlaybookCompleted
            | EventType::PlaybookFailed => Ok(Decision::empty()),
        }
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    fn on_playbook_started(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        if snapshot.is_step_known(START_STEP) {
            return Ok(Decision::empty());
        }

        if playbook.get_step(START_STEP).is_none() {
            return Ok(self.fail_execution(
                snapshot,
                START_STEP,
                &ActionError::validation(format!("Missing reserved step '{}'", START_STEP)),
                0,
            ));
        }

        let mut decision = Decision::empty();
        decision.events.push(
            EventDraft::new(snapshot.execution_id, EventType::StepStarted)
                .node(START_STEP)
                .parent(trigger.event_id),
        );
        Ok(decision)
    }

    /// Step activation: entered steps either open a loop, spawn a child,
    /// complete trivially, or get an action job.
    fn on_step_started(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let name = match &trigger.node_id {
            Some(name) => name.as_str(),
            None => return Ok(Decision::empty()),
        };
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => {
                let error =
                    ActionError::validation(format!("Step '{}' not found in workflow", name));
                return Ok(self.fail_step(snapshot, name, &error));
            }
        };

        let scope = self.base_scope(snapshot);
        let mut decision = Decision::empty();

        if let Some(spec) = &step.r#loop {
            if snapshot.iterators.contains_key(name) {
                return Ok(Decision::empty());
            }
            let items = match self
                .evaluator
                .render_collection(&spec.collection, scope.as_map())
                .and_then(|items| match &spec.filter {
                    Some(filter) => {
                        self.evaluator
                            .filter_items(items, filter, &spec.element, scope.as_map())
                    }
                    None => Ok(items),
                }) {
                Ok(items) => items,
                Err(err) => {
                    let error = ActionError::template(err.to_string());
                    return Ok(self.fail_step(snapshot, name, &error));
                }
            };

            tracing::debug!(
                execution_id = snapshot.execution_id,
                step = name,
                total = items.len(),
                mode = %spec.mode,
                "Opening iterator"
            );

            decision.events.push(
                EventDraft::new(snapshot.execution_id, EventType::IteratorStarted)
                    .node(name)
                    .parent(trigger.event_id)
                    .payload(serde_json::json!({
                        "items": items,
                        "element": spec.element,
                        "mode": spec.mode,
                        "total": items.len(),
                        "chunk": spec.chunk,
                        "fail_policy": spec.fail_policy,
                    })),
            );
            return Ok(decision);
        }

        if step.tool_kind() == ToolKind::ChildPlaybook {
            if snapshot
                .steps
                .get(name)
                .and_then(|info| info.child_execution_id)
                .is_some()
            {
                return Ok(Decision::empty());
            }
            return self.spawn_child(snapshot, trigger, step, 1);
        }

        if step.is_trivial() {
            let result = match &step.args {
                Some(args) => match self.renderer.render_value(args, scope.as_map()) {
                    Ok(rendered) => rendered,
                    Err(err) => {
                        let error = ActionError::template(err.to_string());
                        return Ok(self.fail_step(snapshot, name, &error));
                    }
                },
                None => Value::Object(serde_json::Map::new()),
            };
            decision.events.push(
                EventDraft::new(snapshot.execution_id, EventType::StepCompleted)
                    .node(name)
                    .parent(trigger.event_id)
                    .payload(serde_json::json!({ "result": result })),
            );
            return Ok(decision);
        }

        let job = self
            .builder
            .action_job(snapshot.execution_id, step, &scope, 1, 0.0)?;
        decision.jobs.push(job);
        Ok(decision)
    }

    /// Enqueue the initial iteration window; derived from the event so a
    /// crash between append and enqueue replays cleanly.
    fn on_iterator_started(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let name = match &trigger.node_id {
            Some(name) => name.as_str(),
            None => return Ok(Decision::empty()),
        };
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let (step, frame) = match (playbook.get_step(name), snapshot.iterators.get(name)) {
            (Some(step), Some(frame)) => (step, frame),
            _ => return Ok(Decision::empty()),
        };
        if frame.closed {
            return Ok(Decision::empty());
        }

        let mut decision = Decision::empty();

        if frame.total == 0 {
            decision.events.push(
                EventDraft::new(snapshot.execution_id, EventType::IteratorCompleted)
                    .node(name)
                    .parent(frame.started_event_id)
                    .payload(serde_json::json!({ "results": [] })),
            );
            let mut finish = self.finish_step(
                snapshot,
                step,
                Value::Array(Vec::new()),
                frame.started_event_id,
            )?;
            decision.events.append(&mut finish.events);
            decision.jobs.append(&mut finish.jobs);
            return Ok(decision);
        }

        let initial: Vec<usize> = match frame.mode {
            LoopMode::Sequential => vec![0],
            LoopMode::Parallel => (0..frame.total).collect(),
            LoopMode::Chunked => {
                let window = frame.chunk.unwrap_or(DEFAULT_CHUNK).max(1);
                (0..frame.total.min(window)).collect()
            }
        };

        for index in initial {
            if frame.is_index_settled(index) {
                continue;
            }
            decision
                .jobs
                .push(self.iteration_job_for(snapshot, step, index, 1, 0.0)?);
        }

        Ok(decision)
    }

    fn on_action_completed(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let node = match &trigger.node_id {
            Some(node) => node.as_str(),
            None => return Ok(Decision::empty()),
        };
        let (name, index) = parse_node_id(node);
        if index.is_some() {
            // Iteration outcomes arrive as `iteration_completed`.
            return Ok(Decision::empty());
        }
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => return Ok(Decision::empty()),
        };

        let result = trigger
            .payload
            .get("result")
            .cloned()
            .unwrap_or(Value::Null);

        if let Some(policy) = step.retry.as_ref().and_then(|r| r.on_success.as_ref()) {
            let pages = snapshot
                .steps
                .get(name)
                .map(|info| info.action_results.len())
                .unwrap_or(0) as i32;
            let scope = self.base_scope(snapshot).with_result(&result);

            match retry::evaluate_pagination(policy, pages, scope.as_map(), &self.renderer)? {
                PageDecision::Continue { next_attempt } => {
                    // Rewrites chain: each page's recorded override is the
                    // base for the next one.
                    let prev_args = trigger
                        .payload
                        .get("meta")
                        .and_then(|m| m.get("page_args"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    let next_args = retry::next_call_args(
                        policy,
                        &prev_args,
                        scope.as_map(),
                        &self.renderer,
                    )?;

                    let mut decision = Decision::empty();
                    decision.events.push(
                        EventDraft::new(snapshot.execution_id, EventType::PaginationContinued)
                            .node(name)
                            .parent(trigger.event_id)
                            .attempt(next_attempt)
                            .payload(serde_json::json!({
                                "next_attempt": next_attempt,
                                "args": next_args,
                            })),
                    );
                    return Ok(decision);
                }
                PageDecision::Finish => {
                    let pages = snapshot
                        .steps
                        .get(name)
                        .map(|info| info.action_results.as_slice())
                        .unwrap_or(&[]);
                    let final_result =
                        retry::finalize_paginated_result(&policy.collect, pages);
                    return self.finish_step(snapshot, step, final_result, trigger.event_id);
                }
            }
        }

        self.finish_step(snapshot, step, result, trigger.event_id)
    }

    fn on_action_failed(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let node = match &trigger.node_id {
            Some(node) => node.as_str(),
            None => return Ok(Decision::empty()),
        };
        let (name, index) = parse_node_id(node);
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => return Ok(Decision::empty()),
        };

        let error = trigger
            .error
            .clone()
            .unwrap_or_else(|| ActionError::new(ErrorKind::ExecutorException, "unknown error"));
        let attempts = trigger.attempt.unwrap_or(1);

        let error_value = serde_json::to_value(&error)?;
        let scope = self.base_scope(snapshot).with_error(&error_value);

        let policy = step.retry.as_ref().and_then(|r| r.on_error.as_ref());
        let decision = match policy {
            Some(policy) => retry::evaluate_error_retry(
                policy,
                attempts,
                &error,
                scope.as_map(),
                &self.renderer,
            )?,
            None => ErrorDecision::GiveUp,
        };

        match decision {
            ErrorDecision::Retry {
                delay,
                next_attempt,
            } => {
                tracing::debug!(
                    execution_id = snapshot.execution_id,
                    node = node,
                    delay,
                    next_attempt,
                    "Retry scheduled"
                );
                let mut out = Decision::empty();
                out.events.push(
                    EventDraft::new(snapshot.execution_id, EventType::RetryScheduled)
                        .node(node)
                        .parent(trigger.event_id)
                        .attempt(next_attempt)
                        .payload(serde_json::json!({
                            "delay": delay,
                            "next_attempt": next_attempt,
                        })),
                );
                Ok(out)
            }
            ErrorDecision::GiveUp => match index {
                None => Ok(self.fail_step(snapshot, name, &error)),
                Some(i) => self.on_iteration_failed(snapshot, name, i, &error),
            },
        }
    }

    /// A loop iteration failed for good: apply the frame's fail policy.
    fn on_iteration_failed(
        &self,
        snapshot: &WorkflowState,
        name: &str,
        index: usize,
        error: &ActionError,
    ) -> CoreResult<Decision> {
        let frame = match snapshot.iterators.get(name) {
            Some(frame) => frame,
            None => return Ok(Decision::empty()),
        };

        match frame.fail_policy {
            FailPolicy::FailFast => {
                let cause = ActionError::new(
                    error.kind,
                    format!("iteration {} failed: {}", index, error.message),
                );
                let mut decision = self.fail_step(snapshot, name, &cause);
                decision.kill = KillSet::Iterations(name.to_string());
                Ok(decision)
            }
            FailPolicy::CollectErrors => {
                let mut decision = Decision::empty();
                decision.events.push(
                    EventDraft::new(snapshot.execution_id, EventType::IterationCompleted)
                        .node(name)
                        .parent(frame.started_event_id)
                        .payload(serde_json::json!({
                            "index": index,
                            "error": serde_json::to_value(error)?,
                        })),
                );
                Ok(decision)
            }
        }
    }

    /// Re-enqueue the next attempt recorded by `retry_scheduled`.
    fn on_retry_scheduled(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let node = match &trigger.node_id {
            Some(node) => node.as_str(),
            None => return Ok(Decision::empty()),
        };
        let (name, index) = parse_node_id(node);
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => return Ok(Decision::empty()),
        };

        let delay = trigger
            .payload
            .get("delay")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let next_attempt = trigger
            .payload
            .get("next_attempt")
            .and_then(|v| v.as_i64())
            .unwrap_or(2) as i32;

        if step.tool_kind() == ToolKind::ChildPlaybook {
            return self.spawn_child(snapshot, trigger, step, next_attempt);
        }

        let mut decision = Decision::empty();
        match index {
            Some(i) => {
                decision
                    .jobs
                    .push(self.iteration_job_for(snapshot, step, i, next_attempt, delay)?);
            }
            None => {
                let scope = self.base_scope(snapshot);
                // A failed pagination page retries with its recorded
                // rewrite, not the first-page arguments.
                let page_args = snapshot
                    .steps
                    .get(name)
                    .and_then(|info| info.last_page_args.clone());
                let job = match page_args {
                    Some(args) => {
                        let mut job = self.builder.pagination_job(
                            snapshot.execution_id,
                            step,
                            &scope,
                            args,
                            next_attempt,
                        )?;
                        job.delay = delay;
                        job
                    }
                    None => self.builder.action_job(
                        snapshot.execution_id,
                        step,
                        &scope,
                        next_attempt,
                        delay,
                    )?,
                };
                decision.jobs.push(job);
            }
        }
        Ok(decision)
    }

    /// Enqueue the next page recorded by `pagination_continued`.
    fn on_pagination_continued(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let name = match &trigger.node_id {
            Some(name) => name.as_str(),
            None => return Ok(Decision::empty()),
        };
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => return Ok(Decision::empty()),
        };

        let next_attempt = trigger
            .payload
            .get("next_attempt")
            .and_then(|v| v.as_i64())
            .unwrap_or(2) as i32;
        let args = trigger
            .payload
            .get("args")
            .cloned()
            .unwrap_or(Value::Null);

        let scope = self.base_scope(snapshot);
        let mut decision = Decision::empty();
        decision.jobs.push(self.builder.pagination_job(
            snapshot.execution_id,
            step,
            &scope,
            args,
            next_attempt,
        )?);
        Ok(decision)
    }

    fn on_iteration_completed(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let name = match &trigger.node_id {
            Some(name) => name.as_str(),
            None => return Ok(Decision::empty()),
        };
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let (step, frame) = match (playbook.get_step(name), snapshot.iterators.get(name)) {
            (Some(step), Some(frame)) => (step, frame),
            _ => return Ok(Decision::empty()),
        };
        if frame.closed {
            return Ok(Decision::empty());
        }

        if frame.is_settled() {
            let aggregated = frame.aggregated();
            let mut decision = Decision::empty();
            decision.events.push(
                EventDraft::new(snapshot.execution_id, EventType::IteratorCompleted)
                    .node(name)
                    .parent(frame.started_event_id)
                    .payload(serde_json::json!({ "results": aggregated })),
            );
            let mut finish =
                self.finish_step(snapshot, step, aggregated, frame.started_event_id)?;
            decision.events.append(&mut finish.events);
            decision.jobs.append(&mut finish.jobs);
            return Ok(decision);
        }

        let mut decision = Decision::empty();
        match frame.mode {
            LoopMode::Parallel => {}
            LoopMode::Sequential => {
                if let Some(next) = frame.next_unsettled() {
                    decision
                        .jobs
                        .push(self.iteration_job_for(snapshot, step, next, 1, 0.0)?);
                }
            }
            LoopMode::Chunked => {
                let window = frame.chunk.unwrap_or(DEFAULT_CHUNK).max(1);
                let allowed = frame.total.min(frame.settled_count() + window);
                for index in 0..allowed {
                    if !frame.is_index_settled(index) {
                        decision
                            .jobs
                            .push(self.iteration_job_for(snapshot, step, index, 1, 0.0)?);
                    }
                }
            }
        }
        Ok(decision)
    }

    fn on_step_completed(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let name = match &trigger.node_id {
            Some(name) => name.as_str(),
            None => return Ok(Decision::empty()),
        };
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => return Ok(Decision::empty()),
        };

        let result = trigger
            .payload
            .get("result")
            .cloned()
            .unwrap_or(Value::Null);
        let scope = self
            .base_scope(snapshot)
            .with_result(&result)
            .with_success();

        let targets = match self.evaluator.select_targets(step, scope.as_map()) {
            Ok(targets) => targets,
            Err(err) => {
                let error = ActionError::template(err.to_string());
                return Ok(self.fail_execution(snapshot, name, &error, 0));
            }
        };

        let mut decision = Decision::empty();
        for target in &targets {
            if snapshot.is_step_known(target) {
                tracing::debug!(
                    execution_id = snapshot.execution_id,
                    step = target.as_str(),
                    "Transition target already entered, skipping"
                );
                continue;
            }
            decision.events.push(
                EventDraft::new(snapshot.execution_id, EventType::StepStarted)
                    .node(target.as_str())
                    .parent(trigger.event_id),
            );
        }

        if decision.events.is_empty() {
            return Ok(self.maybe_terminal(snapshot, playbook));
        }
        Ok(decision)
    }

    fn on_step_failed(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let name = match &trigger.node_id {
            Some(name) => name.as_str(),
            None => return Ok(Decision::empty()),
        };
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => return Ok(self.maybe_terminal(snapshot, playbook)),
        };

        let error_value = trigger
            .error
            .as_ref()
            .map(|e| serde_json::to_value(e))
            .transpose()?
            .unwrap_or(Value::Null);
        let scope = self.base_scope(snapshot).with_error(&error_value);

        let targets = self
            .evaluator
            .select_failure_targets(step, scope.as_map())
            .unwrap_or_default();

        let mut decision = Decision::empty();
        for target in &targets {
            if snapshot.is_step_known(target) {
                continue;
            }
            decision.events.push(
                EventDraft::new(snapshot.execution_id, EventType::StepStarted)
                    .node(target.as_str())
                    .parent(trigger.event_id)
                    .payload(serde_json::json!({ "on_failure_of": name })),
            );
        }

        if decision.events.is_empty() {
            return Ok(self.maybe_terminal(snapshot, playbook));
        }
        Ok(decision)
    }

    fn on_sink_completed(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let name = match &trigger.node_id {
            Some(name) => name.as_str(),
            None => return Ok(Decision::empty()),
        };
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => return Ok(Decision::empty()),
        };

        let result = self.step_result(snapshot, step);
        let mut decision = Decision::empty();
        decision.events.push(
            EventDraft::new(snapshot.execution_id, EventType::StepCompleted)
                .node(name)
                .parent(trigger.event_id)
                .payload(serde_json::json!({ "result": result })),
        );
        Ok(decision)
    }

    fn on_sink_failed(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let name = match &trigger.node_id {
            Some(name) => name.as_str(),
            None => return Ok(Decision::empty()),
        };
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => return Ok(Decision::empty()),
        };

        let policy = step
            .sink
            .as_ref()
            .map(|s| s.policy)
            .unwrap_or(SinkFailurePolicy::Warn);
        let error = trigger
            .error
            .clone()
            .unwrap_or_else(|| ActionError::dependency("sink failed"));

        match policy {
            SinkFailurePolicy::Warn => {
                tracing::warn!(
                    execution_id = snapshot.execution_id,
                    step = name,
                    error = %error,
                    "Sink failed, completing step anyway"
                );
                let result = self.step_result(snapshot, step);
                let mut decision = Decision::empty();
                decision.events.push(
                    EventDraft::new(snapshot.execution_id, EventType::StepCompleted)
                        .node(name)
                        .parent(trigger.event_id)
                        .payload(serde_json::json!({ "result": result })),
                );
                Ok(decision)
            }
            SinkFailurePolicy::FailStep => Ok(self.fail_step(snapshot, name, &error)),
        }
    }

    /// Child terminal outcome, equivalent to action success/failure on the
    /// parent step.
    fn on_child_completed(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        playbook: &Playbook,
    ) -> CoreResult<Decision> {
        let name = match &trigger.node_id {
            Some(name) => name.as_str(),
            None => return Ok(Decision::empty()),
        };
        if snapshot.is_step_done(name) {
            return Ok(Decision::empty());
        }
        let step = match playbook.get_step(name) {
            Some(step) => step,
            None => return Ok(Decision::empty()),
        };

        match &trigger.error {
            None => {
                let result = trigger
                    .payload
                    .get("result")
                    .cloned()
                    .unwrap_or(Value::Null);
                self.finish_step(snapshot, step, result, trigger.event_id)
            }
            Some(error) => {
                let attempts = trigger.attempt.unwrap_or(1);
                let error_value = serde_json::to_value(error)?;
                let scope = self.base_scope(snapshot).with_error(&error_value);

                let policy = step.retry.as_ref().and_then(|r| r.on_error.as_ref());
                let decision = match policy {
                    Some(policy) => retry::evaluate_error_retry(
                        policy,
                        attempts,
                        error,
                        scope.as_map(),
                        &self.renderer,
                    )?,
                    None => ErrorDecision::GiveUp,
                };

                match decision {
                    ErrorDecision::Retry {
                        delay,
                        next_attempt,
                    } => {
                        let mut out = Decision::empty();
                        out.events.push(
                            EventDraft::new(snapshot.execution_id, EventType::RetryScheduled)
                                .node(name)
                                .parent(trigger.event_id)
                                .attempt(next_attempt)
                                .payload(serde_json::json!({
                                    "delay": delay,
                                    "next_attempt": next_attempt,
                                })),
                        );
                        Ok(out)
                    }
                    ErrorDecision::GiveUp => Ok(self.fail_step(snapshot, name, error)),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared pieces
    // ------------------------------------------------------------------

    fn base_scope(&self, snapshot: &WorkflowState) -> Scope {
        Scope::new()
            .with_workload(snapshot.workload.as_ref().unwrap_or(&Value::Null))
            .with_step_results(&snapshot.step_results())
            .with_execution_id(snapshot.execution_id)
    }

    /// Step exit: run the sink when configured and matching, else complete.
    fn finish_step(
        &self,
        snapshot: &WorkflowState,
        step: &Step,
        result: Value,
        parent_event_id: i64,
    ) -> CoreResult<Decision> {
        let mut decision = Decision::empty();

        if let Some(sink) = &step.sink {
            let scope = self
                .base_scope(snapshot)
                .with_result(&result)
                .with_success();
            let matches = match &sink.when {
                Some(when) => self.evaluator.evaluate_condition(when, scope.as_map())?,
                None => true,
            };
            if matches {
                decision.jobs.push(self.builder.sink_job(
                    snapshot.execution_id,
                    step,
                    sink,
                    &scope,
                )?);
                // step_completed waits for the sink outcome
                return Ok(decision);
            }
        }

        decision.events.push(
            EventDraft::new(snapshot.execution_id, EventType::StepCompleted)
                .node(&step.step)
                .parent(parent_event_id)
                .payload(serde_json::json!({ "result": result })),
        );
        Ok(decision)
    }

    /// The effective result of a step, recomputed from the snapshot.
    fn step_result(&self, snapshot: &WorkflowState, step: &Step) -> Value {
        if let Some(policy) = step.retry.as_ref().and_then(|r| r.on_success.as_ref()) {
            if let Some(info) = snapshot.steps.get(&step.step) {
                if !info.action_results.is_empty() {
                    return retry::finalize_paginated_result(
                        &policy.collect,
                        &info.action_results,
                    );
                }
            }
        }
        if let Some(frame) = snapshot.iterators.get(&step.step) {
            if frame.is_settled() {
                return frame.aggregated();
            }
        }
        snapshot
            .steps
            .get(&step.step)
            .and_then(|info| info.last_action_result())
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn fail_step(&self, snapshot: &WorkflowState, name: &str, error: &ActionError) -> Decision {
        let mut decision = Decision::empty();
        decision.events.push(
            EventDraft::new(snapshot.execution_id, EventType::StepFailed)
                .node(name)
                .error(error.clone()),
        );
        decision
    }

    fn fail_execution(
        &self,
        snapshot: &WorkflowState,
        step: &str,
        error: &ActionError,
        attempts: i32,
    ) -> Decision {
        let mut decision = Decision::empty();
        decision.events.push(
            EventDraft::new(snapshot.execution_id, EventType::PlaybookFailed)
                .error(error.clone())
                .payload(serde_json::json!({
                    "cause": {
                        "step": step,
                        "kind": error.kind,
                        "message": error.message,
                        "attempts": attempts,
                    }
                })),
        );
        decision.kill = KillSet::All;
        decision
    }

    /// Terminal detection: when no live work remains, the execution
    /// completes, or fails when an unhandled failed step exists.
    fn maybe_terminal(&self, snapshot: &WorkflowState, _playbook: &Playbook) -> Decision {
        if snapshot.state.is_terminal() || snapshot.has_live_work() {
            return Decision::empty();
        }

        let unhandled: Vec<_> = snapshot
            .failed_steps()
            .into_iter()
            .filter(|info| !snapshot.handled_failures.contains(&info.name))
            .collect();

        if let Some(first) = unhandled.first() {
            let error = first
                .error
                .clone()
                .unwrap_or_else(|| ActionError::new(ErrorKind::ExecutorException, "step failed"));
            return self.fail_execution(snapshot, &first.name, &error, first.attempts);
        }

        let mut decision = Decision::empty();
        decision.events.push(
            EventDraft::new(snapshot.execution_id, EventType::PlaybookCompleted)
                .payload(serde_json::json!({})),
        );
        decision
    }

    fn spawn_child(
        &self,
        snapshot: &WorkflowState,
        trigger: &Event,
        step: &Step,
        attempt: i32,
    ) -> CoreResult<Decision> {
        let tool = step.tool_spec();
        let path = match &tool.path {
            Some(path) => path.clone(),
            None => {
                let error = ActionError::validation(format!(
                    "Step '{}' is child_playbook but has no tool.path",
                    step.step
                ));
                return Ok(self.fail_step(snapshot, &step.step, &error));
            }
        };

        let scope = self.base_scope(snapshot);
        let payload = match &step.args {
            Some(args) => self
                .renderer
                .render_value(args, scope.as_map())
                .unwrap_or(Value::Null),
            None => Value::Object(serde_json::Map::new()),
        };

        let mut decision = Decision::empty();
        decision.events.push(
            EventDraft::new(snapshot.execution_id, EventType::ActionStarted)
                .node(&step.step)
                .parent(trigger.event_id)
                .attempt(attempt),
        );
        decision.children.push(ChildSpawn {
            step: step.step.clone(),
            path,
            version: tool.version,
            payload,
        });
        Ok(decision)
    }

    fn iteration_job_for(
        &self,
        snapshot: &WorkflowState,
        step: &Step,
        index: usize,
        attempt: i32,
        delay: f64,
    ) -> CoreResult<JobDraft> {
        let frame = snapshot.iterators.get(&step.step).ok_or_else(|| {
            crate::error::CoreError::Validation(format!(
                "No iterator frame open for step '{}'",
                step.step
            ))
        })?;
        let item = frame
            .items
            .get(index)
            .cloned()
            .unwrap_or(Value::Null);

        let scope = self
            .base_scope(snapshot)
            .with_item(&frame.element, &item, index, frame.total);

        self.builder.iteration_job(
            snapshot.execution_id,
            step,
            &scope,
            IterationMeta {
                step: step.step.clone(),
                index,
                total: frame.total,
                element: frame.element.clone(),
                item,
                parent_event_id: frame.started_event_id,
            },
            attempt,
            delay,
        )
    }
}
