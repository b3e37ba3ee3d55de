//! Store contracts shared by the broker and the workers.
//!
//! Each trait has two implementations: PostgreSQL (production) and in-memory
//! (tests). Semantics are identical; the scenario tests in `floe-broker`
//! exercise the in-memory variant.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use floe_core::event::{Event, EventDraft};
use floe_core::job::{Job, JobDraft};
use floe_core::sensitive::Sensitive;

use crate::error::StoreResult;

/// Append-only, totally-ordered event log keyed by execution.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event; assigns and returns the per-execution `event_id`.
    ///
    /// Appends after a terminal event fail with
    /// [`StoreError::TerminalRecorded`](crate::StoreError::TerminalRecorded);
    /// callers treat that as a no-op.
    async fn append(&self, draft: EventDraft) -> StoreResult<i64>;

    /// Events of one execution in order, strictly after `after` when given.
    async fn range(&self, execution_id: i64, after: Option<i64>) -> StoreResult<Vec<Event>>;

    /// Highest `event_id` of an execution, if any.
    async fn head(&self, execution_id: i64) -> StoreResult<Option<i64>>;
}

/// Heartbeat outcome for a leased job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// Lease extended.
    Ok,
    /// Lease was revoked (expired and re-leased, or row finished).
    Lost,
    /// Lease extended, but the execution wants the job cancelled.
    CancelRequested,
}

/// Outcome of failing a job at the queue level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Returned to the queue for redelivery.
    Requeued { available_at: DateTime<Utc> },
    /// Processed, outcome recorded in the event log; row closed.
    Failed,
    /// Dead-lettered.
    Dead,
}

/// Durable FIFO-with-priority of leasable jobs.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Insert a job. Returns `None` when the uniqueness key
    /// `(execution_id, node_id, attempt)` already exists.
    async fn enqueue(&self, draft: JobDraft) -> StoreResult<Option<i64>>;

    /// Atomically lease up to `max_jobs` dispatchable jobs.
    async fn lease(
        &self,
        worker_id: &str,
        max_jobs: i64,
        visibility: Duration,
    ) -> StoreResult<Vec<Job>>;

    /// Extend a lease and learn about cancellation.
    async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
        visibility: Duration,
    ) -> StoreResult<HeartbeatStatus>;

    /// Mark a job completed.
    async fn complete(&self, queue_id: i64) -> StoreResult<()>;

    /// Fail a job. With `retry` and lease budget remaining the row goes
    /// back to `queued` after `delay`; with `retry` and no budget it is
    /// dead-lettered; without `retry` the row closes as `failed` (the
    /// outcome lives in the event log and the broker decides any retry).
    async fn fail(&self, queue_id: i64, retry: bool, delay: Duration) -> StoreResult<FailOutcome>;

    /// Return expired leases to `queued`; exhausted rows go to `dead`.
    /// Returns the number of reclaimed leases.
    async fn reap(&self) -> StoreResult<u64>;

    /// Mark all queued jobs of an execution `dead`. Returns the count.
    async fn kill_execution(&self, execution_id: i64) -> StoreResult<u64>;

    /// Mark queued jobs of an execution whose node id starts with `prefix`
    /// as `dead`. Returns the count.
    async fn kill_node_prefix(&self, execution_id: i64, prefix: &str) -> StoreResult<u64>;

    /// Manually re-activate a dead-lettered job with a fresh lease budget.
    async fn requeue_dead(&self, queue_id: i64) -> StoreResult<()>;
}

/// Broker-side execution bookkeeping: slot leases, cursors, cancellation,
/// and the parent/child registry.
#[async_trait]
pub trait BrokerState: Send + Sync {
    /// Allocate a fresh execution id.
    async fn allocate_execution_id(&self) -> StoreResult<i64>;

    /// Register an execution (cursor row, parent linkage).
    async fn register_execution(
        &self,
        execution_id: i64,
        parent_execution_id: Option<i64>,
        parent_step: Option<&str>,
    ) -> StoreResult<()>;

    /// Claim the broker slot for an execution. At most one broker holds a
    /// valid claim at a time; expiry hands it over.
    async fn claim(&self, execution_id: i64, broker_id: &str, ttl: Duration) -> StoreResult<bool>;

    /// Release a held broker slot.
    async fn release(&self, execution_id: i64, broker_id: &str) -> StoreResult<()>;

    /// Last event id the broker processed for an execution.
    async fn cursor(&self, execution_id: i64) -> StoreResult<i64>;

    /// Advance the processed-events cursor.
    async fn advance_cursor(&self, execution_id: i64, event_id: i64) -> StoreResult<()>;

    /// Executions with events beyond their cursor and no live foreign claim.
    async fn dirty_executions(&self, limit: i64) -> StoreResult<Vec<i64>>;

    /// Flag an execution for cancellation (reported via job heartbeats).
    async fn request_cancel(&self, execution_id: i64) -> StoreResult<()>;

    /// Whether cancellation was requested.
    async fn cancel_requested(&self, execution_id: i64) -> StoreResult<bool>;

    /// Child executions registered under a parent.
    async fn children(&self, execution_id: i64) -> StoreResult<Vec<i64>>;

    /// Parent linkage of an execution, if any.
    async fn parent(&self, execution_id: i64) -> StoreResult<Option<(i64, String)>>;
}

/// A registered playbook version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub catalog_id: i64,
    pub path: String,
    pub version: i32,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Versioned playbook storage.
#[async_trait]
pub trait PlaybookCatalog: Send + Sync {
    /// Register a playbook under a path; versions auto-increment.
    async fn register(&self, path: &str, content: &str) -> StoreResult<CatalogEntry>;

    /// Fetch a playbook by path, latest version when `version` is absent.
    async fn fetch(&self, path: &str, version: Option<i32>) -> StoreResult<Option<CatalogEntry>>;

    /// List the latest version of every registered path.
    async fn list(&self) -> StoreResult<Vec<CatalogEntry>>;
}

/// Ephemeral credential material returned by the resolver.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Credential type tag (e.g. "bearer", "postgres").
    pub kind: String,

    /// Field map; values never serialize in the clear.
    pub fields: HashMap<String, Sensitive<String>>,
}

/// Keyed credential lookup. Values are ephemeral and redacted in logs.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve a credential key to its field map.
    async fn resolve(&self, key: &str) -> StoreResult<Option<Credential>>;
}
