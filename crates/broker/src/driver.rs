//! Decision application.
//!
//! Takes the pure orchestrator output and performs the I/O: append events,
//! enqueue jobs, submit children, invalidate queued work. Every operation
//! is idempotent under replay: appends are guarded by the terminal check
//! and snapshot-driven decisions, enqueues by the queue uniqueness key.

use std::sync::Arc;

use floe_core::engine::orchestrator::{ChildSpawn, Decision, KillSet};
use floe_core::error::ActionError;
use floe_core::event::{EventDraft, EventType};
use floe_store::{EventLog, StoreError, WorkQueue};

use crate::error::AppResult;
use crate::submission::{self, Store, SubmitRequest};

/// Applies decisions against the store.
pub struct Driver {
    store: Arc<dyn Store>,
}

impl Driver {
    /// Create a driver.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Apply one decision for an execution.
    pub async fn apply(&self, execution_id: i64, decision: Decision) -> AppResult<()> {
        match &decision.kill {
            KillSet::None => {}
            KillSet::Iterations(step) => {
                let killed = self
                    .store
                    .kill_node_prefix(execution_id, &format!("{}[", step))
                    .await?;
                tracing::debug!(execution_id, step = %step, killed, "Cancelled iteration jobs");
            }
            KillSet::All => {
                let killed = self.store.kill_execution(execution_id).await?;
                tracing::debug!(execution_id, killed, "Cancelled queued jobs");
            }
        }

        for draft in decision.events {
            match self.store.append(draft).await {
                Ok(_) => {}
                Err(StoreError::TerminalRecorded(_)) => {
                    // Execution terminated concurrently; later emissions of
                    // this decision are moot.
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }

        for job in decision.jobs {
            let node_id = job.node_id.clone();
            if self.store.enqueue(job).await?.is_none() {
                tracing::debug!(execution_id, node = %node_id, "Job already enqueued");
            }
        }

        for child in decision.children {
            self.spawn_child(execution_id, child).await?;
        }

        Ok(())
    }

    /// Submit a child execution and record `child_started` on the parent.
    async fn spawn_child(&self, execution_id: i64, spawn: ChildSpawn) -> AppResult<()> {
        let request = SubmitRequest {
            path: spawn.path.clone(),
            version: spawn.version,
            payload: Some(spawn.payload.clone()),
        };

        match submission::submit(self.store.as_ref(), &request, Some((execution_id, &spawn.step)))
            .await
        {
            Ok(child_execution_id) => {
                let draft = EventDraft::new(execution_id, EventType::ChildStarted)
                    .node(&spawn.step)
                    .payload(serde_json::json!({
                        "child_execution_id": child_execution_id,
                        "path": spawn.path,
                    }));
                match self.store.append(draft).await {
                    Ok(_) | Err(StoreError::TerminalRecorded(_)) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => {
                // The child could not even start; surface it as a step failure.
                let error = ActionError::validation(format!(
                    "Child playbook '{}' failed to start: {}",
                    spawn.path, err
                ));
                let draft = EventDraft::new(execution_id, EventType::StepFailed)
                    .node(&spawn.step)
                    .error(error);
                match self.store.append(draft).await {
                    Ok(_) | Err(StoreError::TerminalRecorded(_)) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}
