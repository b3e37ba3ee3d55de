//! Per-job execution: render, invoke, report.
//!
//! One `JobProcessor` handles one leased job end to end: resolve
//! credentials, render the tool call over the job context, emit the start
//! event, run the executor under deadline and cancellation, and stream the
//! outcome back as events plus the queue-row transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use floe_core::context::Scope;
use floe_core::engine::retry::deep_merge;
use floe_core::error::{ActionError, ErrorKind};
use floe_core::event::{EventDraft, EventType};
use floe_core::job::{Job, JobKind, TaskSpec};
use floe_core::sensitive::Sensitive;
use floe_core::template::TemplateRenderer;
use floe_store::{CredentialResolver, EventLog, HeartbeatStatus, StoreError, WorkQueue};
use floe_tools::{ToolContext, ToolRegistry, ToolResult};

use crate::config::WorkerConfig;

/// Why the job loop stopped caring about a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Result events emitted, row completed.
    Completed,
    /// Failure events emitted, row failed.
    Failed,
    /// Lease lost; abandoned without events.
    Abandoned,
}

/// Executes leased jobs.
pub struct JobProcessor {
    config: WorkerConfig,
    queue: Arc<dyn WorkQueue>,
    events: Arc<dyn EventLog>,
    credentials: Arc<dyn CredentialResolver>,
    registry: Arc<ToolRegistry>,
    renderer: TemplateRenderer,
}

impl JobProcessor {
    /// Create a processor.
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn WorkQueue>,
        events: Arc<dyn EventLog>,
        credentials: Arc<dyn CredentialResolver>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            config,
            queue,
            events,
            credentials,
            registry,
            renderer: TemplateRenderer::new(),
        }
    }

    /// Process one leased job to completion.
    pub async fn process(&self, job: Job) -> JobOutcome {
        let task = match job.task() {
            Ok(task) => task,
            Err(err) => {
                let error = ActionError::validation(format!("Unreadable task: {}", err));
                return self.report_failure(&job, None, error).await;
            }
        };

        // Heartbeat task: extends the lease at a third of the visibility
        // window. A lost lease abandons the job; a cancel request flows
        // into the executor's token.
        let cancel = CancellationToken::new();
        let abandon = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(&job, cancel.clone(), abandon.clone());

        let outcome = self.run(&job, &task, cancel).await;

        heartbeat.abort();

        match outcome {
            RunOutcome::Success(result) => self.report_success(&job, &task, result).await,
            RunOutcome::Failure(error) => self.report_failure(&job, Some(&task), error).await,
            RunOutcome::Abandoned => {
                tracing::warn!(
                    queue_id = job.queue_id,
                    node = %job.node_id,
                    "Lease lost, abandoning job"
                );
                JobOutcome::Abandoned
            }
        }
    }

    fn spawn_heartbeat(
        &self,
        job: &Job,
        cancel: CancellationToken,
        abandon: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let queue_id = job.queue_id;
        let worker_id = self.config.worker_id.clone();
        let visibility = self.config.visibility;
        let beat = self.config.lease_beat();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(beat);
            ticker.tick().await; // immediate first tick

            loop {
                ticker.tick().await;
                match queue.heartbeat(queue_id, &worker_id, visibility).await {
                    Ok(HeartbeatStatus::Ok) => {}
                    Ok(HeartbeatStatus::CancelRequested) => {
                        cancel.cancel();
                    }
                    Ok(HeartbeatStatus::Lost) => {
                        abandon.cancel();
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(queue_id, error = %err, "Heartbeat failed");
                    }
                }
            }
        })
    }

    async fn run(&self, job: &Job, task: &TaskSpec, cancel: CancellationToken) -> RunOutcome {
        // Resolve credentials (ephemeral, never logged or persisted).
        let auth = match self.resolve_auth(task).await {
            Ok(auth) => auth,
            Err(error) => return RunOutcome::Failure(error),
        };

        // Build the rendering scope: job context + revealed auth.
        let sensitive: HashMap<String, HashMap<String, Sensitive<String>>> = auth
            .iter()
            .map(|(alias, fields)| {
                (
                    alias.clone(),
                    fields
                        .iter()
                        .map(|(k, v)| (k.clone(), Sensitive::new(v.clone())))
                        .collect(),
                )
            })
            .collect();
        let scope = Scope::from_value(&job.context).with_auth(&sensitive);

        // Render the base args, then apply any pre-merged pagination
        // override on top.
        let rendered = match self.renderer.render_value(&task.tool.args, scope.as_map()) {
            Ok(rendered) => rendered,
            Err(err) => {
                return RunOutcome::Failure(ActionError::template(err.to_string()));
            }
        };
        let args = match &task.args_override {
            Some(over) => deep_merge(&rendered, over),
            None => rendered,
        };

        // Sinks have no start event; actions and iterations do.
        if job.kind == JobKind::Action {
            let draft = EventDraft::new(job.execution_id, EventType::ActionStarted)
                .node(&job.node_id)
                .attempt(job.attempt)
                .worker(&self.config.worker_id);
            match self.events.append(draft).await {
                Ok(_) => {}
                Err(StoreError::TerminalRecorded(_)) => {
                    // Execution finished underneath us; the job is moot.
                    let _ = self.queue.complete(job.queue_id).await;
                    return RunOutcome::Abandoned;
                }
                Err(err) => {
                    tracing::error!(queue_id = job.queue_id, error = %err, "Event append failed");
                    return RunOutcome::Abandoned;
                }
            }
        }

        let timeout = task
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_timeout);

        let ctx = ToolContext::new(job.execution_id, &job.node_id)
            .with_attempt(job.attempt)
            .with_auth(auth)
            .with_deadline(timeout)
            .with_cancel(cancel.clone());

        let execution = self.registry.execute(task.tool.kind, &args, &ctx);

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, execution) => result,
            _ = ctx.cancel.cancelled() => {
                return RunOutcome::Failure(ActionError::cancelled("cancel requested"));
            }
        };

        match result {
            Err(_) => {
                // Deadline crossed: force-cancel the executor.
                cancel.cancel();
                RunOutcome::Failure(ActionError::timeout(format!(
                    "Deadline of {}s exceeded",
                    timeout.as_secs()
                )))
            }
            Ok(Err(tool_err)) => RunOutcome::Failure(tool_err.to_action_error()),
            Ok(Ok(result)) if result.is_success() => RunOutcome::Success(result),
            Ok(Ok(result)) => {
                let error = result
                    .error
                    .unwrap_or_else(|| {
                        ActionError::new(ErrorKind::ExecutorException, "tool reported failure")
                    });
                RunOutcome::Failure(error)
            }
        }
    }

    async fn resolve_auth(
        &self,
        task: &TaskSpec,
    ) -> Result<HashMap<String, HashMap<String, String>>, ActionError> {
        let mut resolved = HashMap::new();
        if let Some(aliases) = &task.auth {
            for (alias, key) in aliases {
                let credential = self
                    .credentials
                    .resolve(key)
                    .await
                    .map_err(|err| {
                        ActionError::dependency(format!("Credential lookup '{}': {}", key, err))
                    })?
                    .ok_or_else(|| {
                        ActionError::validation(format!("Unknown credential '{}'", key))
                    })?;

                let fields: HashMap<String, String> = credential
                    .fields
                    .into_iter()
                    .map(|(field, value)| (field, value.into_inner()))
                    .collect();
                resolved.insert(alias.clone(), fields);
            }
        }
        Ok(resolved)
    }

    async fn report_success(&self, job: &Job, task: &TaskSpec, result: ToolResult) -> JobOutcome {
        let mut meta = result.meta.clone().unwrap_or(serde_json::json!({}));
        if let Some(over) = &task.args_override {
            // The broker chains pagination rewrites off the recorded args.
            if let Some(map) = meta.as_object_mut() {
                map.insert("page_args".to_string(), over.clone());
            }
        }

        let draft = match (&job.kind, &task.iteration) {
            (JobKind::Sink, _) => EventDraft::new(job.execution_id, EventType::SinkCompleted)
                .node(&job.node_id)
                .worker(&self.config.worker_id)
                .payload(serde_json::json!({ "result": result.data })),
            (JobKind::Action, Some(iteration)) => {
                EventDraft::new(job.execution_id, EventType::IterationCompleted)
                    .node(&iteration.step)
                    .parent(iteration.parent_event_id)
                    .attempt(job.attempt)
                    .worker(&self.config.worker_id)
                    .payload(serde_json::json!({
                        "index": iteration.index,
                        "result": result.data,
                    }))
            }
            (JobKind::Action, None) => {
                EventDraft::new(job.execution_id, EventType::ActionCompleted)
                    .node(&job.node_id)
                    .attempt(job.attempt)
                    .worker(&self.config.worker_id)
                    .payload(serde_json::json!({
                        "result": result.data,
                        "meta": meta,
                    }))
            }
        };

        match self.events.append(draft).await {
            Ok(_) | Err(StoreError::TerminalRecorded(_)) => {}
            Err(err) => {
                // Keep the lease untouched: the queue redelivers and the
                // uniqueness guards make the replay harmless.
                tracing::error!(queue_id = job.queue_id, error = %err, "Event append failed");
                return JobOutcome::Abandoned;
            }
        }

        let _ = self.queue.complete(job.queue_id).await;
        JobOutcome::Completed
    }

    async fn report_failure(
        &self,
        job: &Job,
        _task: Option<&TaskSpec>,
        error: ActionError,
    ) -> JobOutcome {
        tracing::debug!(
            queue_id = job.queue_id,
            node = %job.node_id,
            kind = %error.kind,
            "Job failed"
        );

        let draft = match job.kind {
            JobKind::Sink => EventDraft::new(job.execution_id, EventType::SinkFailed)
                .node(&job.node_id)
                .worker(&self.config.worker_id)
                .error(error),
            JobKind::Action => {
                // Iteration failures keep the suffixed node id so the broker
                // can attribute them to their index.
                EventDraft::new(job.execution_id, EventType::ActionFailed)
                    .node(&job.node_id)
                    .attempt(job.attempt)
                    .worker(&self.config.worker_id)
                    .error(error)
            }
        };

        match self.events.append(draft).await {
            Ok(_) | Err(StoreError::TerminalRecorded(_)) => {}
            Err(err) => {
                tracing::error!(queue_id = job.queue_id, error = %err, "Event append failed");
                return JobOutcome::Abandoned;
            }
        }

        let _ = self
            .queue
            .fail(job.queue_id, false, Duration::from_secs(0))
            .await;
        JobOutcome::Failed
    }
}

enum RunOutcome {
    Success(ToolResult),
    Failure(ActionError),
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_core::job::{JobDraft, JobStatus, ToolCall};
    use floe_core::playbook::types::ToolKind;
    use floe_store::{BrokerState, MemoryStore};
    use floe_tools::create_default_registry;

    fn processor(store: Arc<MemoryStore>) -> JobProcessor {
        JobProcessor::new(
            WorkerConfig::default(),
            store.clone(),
            store.clone(),
            store,
            Arc::new(create_default_registry()),
        )
    }

    async fn lease_one(store: &MemoryStore) -> Job {
        let mut jobs = store
            .lease("test-worker", 1, Duration::from_secs(30))
            .await
            .unwrap();
        jobs.remove(0)
    }

    #[tokio::test]
    async fn test_noop_action_emits_started_and_completed() {
        let store = Arc::new(MemoryStore::new());
        store.register_execution(1, None, None).await.unwrap();

        let task = TaskSpec::new(ToolCall {
            kind: ToolKind::Noop,
            args: serde_json::json!({"marker": "{{ workload.name }}"}),
        });
        let draft = JobDraft::new(1, "a", &task)
            .context(serde_json::json!({"workload": {"name": "floe"}}));
        store.enqueue(draft).await.unwrap();

        let job = lease_one(&store).await;
        let outcome = processor(store.clone()).process(job).await;
        assert_eq!(outcome, JobOutcome::Completed);

        let events = store.events_for(1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::ActionStarted);
        assert_eq!(events[1].event_type, EventType::ActionCompleted);
        assert_eq!(events[1].payload["result"]["marker"], "floe");

        let jobs = store.all_jobs();
        assert_eq!(jobs[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_iteration_job_emits_iteration_completed() {
        let store = Arc::new(MemoryStore::new());
        store.register_execution(1, None, None).await.unwrap();

        let mut task = TaskSpec::new(ToolCall {
            kind: ToolKind::Noop,
            args: serde_json::json!({"item": "{{ city }}"}),
        });
        task.iteration = Some(floe_core::job::IterationMeta {
            step: "fanout".to_string(),
            index: 1,
            total: 3,
            element: "city".to_string(),
            item: serde_json::json!("berlin"),
            parent_event_id: 5,
        });
        let draft = JobDraft::new(1, "fanout[1]", &task)
            .context(serde_json::json!({"city": "berlin"}));
        store.enqueue(draft).await.unwrap();

        let job = lease_one(&store).await;
        processor(store.clone()).process(job).await;

        let events = store.events_for(1);
        assert_eq!(events[1].event_type, EventType::IterationCompleted);
        assert_eq!(events[1].node_id.as_deref(), Some("fanout"));
        assert_eq!(events[1].parent_event_id, Some(5));
        assert_eq!(events[1].payload["index"], 1);
        assert_eq!(events[1].payload["result"]["item"], "berlin");
    }

    #[tokio::test]
    async fn test_shell_failure_emits_action_failed() {
        let store = Arc::new(MemoryStore::new());
        store.register_execution(1, None, None).await.unwrap();

        let task = TaskSpec::new(ToolCall {
            kind: ToolKind::Shell,
            args: serde_json::json!({"command": "exit 7"}),
        });
        store.enqueue(JobDraft::new(1, "sh", &task)).await.unwrap();

        let job = lease_one(&store).await;
        let outcome = processor(store.clone()).process(job).await;
        assert_eq!(outcome, JobOutcome::Failed);

        let events = store.events_for(1);
        assert_eq!(events[1].event_type, EventType::ActionFailed);
        let error = events[1].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Dependency);
        assert_eq!(error.status, Some(7));

        let jobs = store.all_jobs();
        assert_eq!(jobs[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_sink_job_emits_sink_events_only() {
        let store = Arc::new(MemoryStore::new());
        store.register_execution(1, None, None).await.unwrap();

        let task = TaskSpec::new(ToolCall {
            kind: ToolKind::Noop,
            args: serde_json::json!({"stored": true}),
        });
        let draft = JobDraft::new(1, "load~sink", &task).kind(JobKind::Sink);
        store.enqueue(draft).await.unwrap();

        let job = lease_one(&store).await;
        processor(store.clone()).process(job).await;

        let events = store.events_for(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::SinkCompleted);
    }

    #[tokio::test]
    async fn test_auth_resolution_renders_into_args() {
        let store = Arc::new(MemoryStore::new());
        store.register_execution(1, None, None).await.unwrap();
        let mut fields = HashMap::new();
        fields.insert("token".to_string(), "tok-xyz".to_string());
        store.put_credential("api-cred", "bearer", fields);

        let mut task = TaskSpec::new(ToolCall {
            kind: ToolKind::Noop,
            args: serde_json::json!({"header": "Bearer {{ auth.api.token }}"}),
        });
        let mut aliases = HashMap::new();
        aliases.insert("api".to_string(), "api-cred".to_string());
        task.auth = Some(aliases);

        store.enqueue(JobDraft::new(1, "a", &task)).await.unwrap();

        let job = lease_one(&store).await;
        processor(store.clone()).process(job).await;

        let events = store.events_for(1);
        // Rendered through, but redacted on append by the sanitizer.
        assert_eq!(events[1].event_type, EventType::ActionCompleted);
        assert_eq!(events[1].payload["result"]["header"], "[REDACTED]");
    }

    #[tokio::test]
    async fn test_missing_credential_fails_validation() {
        let store = Arc::new(MemoryStore::new());
        store.register_execution(1, None, None).await.unwrap();

        let mut task = TaskSpec::new(ToolCall {
            kind: ToolKind::Noop,
            args: serde_json::Value::Null,
        });
        let mut aliases = HashMap::new();
        aliases.insert("api".to_string(), "ghost".to_string());
        task.auth = Some(aliases);

        store.enqueue(JobDraft::new(1, "a", &task)).await.unwrap();

        let job = lease_one(&store).await;
        let outcome = processor(store.clone()).process(job).await;
        assert_eq!(outcome, JobOutcome::Failed);

        let events = store.events_for(1);
        let failed = events
            .iter()
            .find(|e| e.event_type == EventType::ActionFailed)
            .unwrap();
        assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::Validation);
    }
}
