//! Execution submission and cancellation.
//!
//! Submission allocates the execution id, registers the cursor row, and
//! appends `playbook_started`; the dispatcher does the rest. Cancellation
//! appends the terminal event, kills queued jobs, and walks the children.

use serde_json::Value;

use floe_core::engine::retry::deep_merge;
use floe_core::error::ActionError;
use floe_core::event::{EventDraft, EventType};
use floe_core::playbook;
use floe_store::{BrokerState, EventLog, PlaybookCatalog, StoreError, WorkQueue};

use crate::error::{AppError, AppResult};

/// Everything the broker needs from the store, as one object.
pub trait Store:
    EventLog + WorkQueue + BrokerState + PlaybookCatalog + Send + Sync
{
}

impl<T> Store for T where T: EventLog + WorkQueue + BrokerState + PlaybookCatalog + Send + Sync {}

/// Submission request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubmitRequest {
    /// Catalog path of the playbook.
    pub path: String,

    /// Pinned version; latest when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,

    /// Input payload, merged over the playbook's declared workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Submit a new execution. Returns the allocated execution id.
pub async fn submit(
    store: &dyn Store,
    request: &SubmitRequest,
    parent: Option<(i64, &str)>,
) -> AppResult<i64> {
    let entry = store
        .fetch(&request.path, request.version)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Playbook not found: {} (version {:?})",
                request.path, request.version
            ))
        })?;

    // Parse up front so an invalid playbook is rejected at submission.
    let parsed = playbook::parse(&entry.content)?;

    let execution_id = store.allocate_execution_id().await?;
    store
        .register_execution(
            execution_id,
            parent.map(|(id, _)| id),
            parent.map(|(_, step)| step),
        )
        .await?;

    let workload = deep_merge(
        parsed.workload.as_ref().unwrap_or(&Value::Null),
        request.payload.as_ref().unwrap_or(&Value::Null),
    );

    let mut payload = serde_json::json!({
        "path": entry.path,
        "version": entry.version,
        "workload": workload,
    });
    if let Some((parent_id, parent_step)) = parent {
        payload["parent_execution_id"] = serde_json::json!(parent_id);
        payload["parent_step"] = serde_json::json!(parent_step);
    }

    store
        .append(EventDraft::new(execution_id, EventType::PlaybookStarted).payload(payload))
        .await?;

    tracing::info!(
        execution_id,
        path = %entry.path,
        version = entry.version,
        parent = ?parent.map(|(id, _)| id),
        "Execution submitted"
    );

    Ok(execution_id)
}

/// Cancel an execution and its non-terminal children.
pub async fn cancel(store: &dyn Store, execution_id: i64) -> AppResult<()> {
    // Depth-first over the child registry; ids only, no object references.
    let mut pending = vec![execution_id];
    while let Some(current) = pending.pop() {
        pending.extend(store.children(current).await?);

        store.request_cancel(current).await?;

        let draft = EventDraft::new(current, EventType::PlaybookFailed)
            .error(ActionError::cancelled("cancel requested"));
        match store.append(draft).await {
            Ok(_) => {
                tracing::info!(execution_id = current, "Execution cancelled");
            }
            // Already finished; nothing to cancel.
            Err(StoreError::TerminalRecorded(_)) => {}
            Err(err) => return Err(err.into()),
        }

        store.kill_execution(current).await?;
    }

    Ok(())
}
