//! In-memory implementation of the store contracts.
//!
//! Same semantics as the PostgreSQL implementation, held in process memory.
//! Primarily for tests: the broker scenario suite runs entirely against
//! this store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use floe_core::event::{Event, EventDraft};
use floe_core::job::{Job, JobDraft, JobStatus};
use floe_core::sanitize::sanitize;
use floe_core::sensitive::Sensitive;

use crate::api::{
    BrokerState, CatalogEntry, Credential, CredentialResolver, EventLog, FailOutcome,
    HeartbeatStatus, PlaybookCatalog, WorkQueue,
};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
struct CursorRow {
    last_event_id: i64,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    cancel_requested: bool,
    parent: Option<(i64, String)>,
}

/// In-memory store. Cheap to clone behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<HashMap<i64, Vec<Event>>>,
    jobs: RwLock<BTreeMap<i64, Job>>,
    cursors: RwLock<HashMap<i64, CursorRow>>,
    catalog: RwLock<Vec<CatalogEntry>>,
    credentials: RwLock<HashMap<String, (String, HashMap<String, String>)>>,
    next_queue_id: AtomicI64,
    next_execution_id: AtomicI64,
    next_catalog_id: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a credential for tests.
    pub fn put_credential(&self, name: &str, kind: &str, fields: HashMap<String, String>) {
        self.credentials
            .write()
            .insert(name.to_string(), (kind.to_string(), fields));
    }

    /// Snapshot of all queue rows, for assertions.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.jobs.read().values().cloned().collect()
    }

    /// All events of one execution, for assertions.
    pub fn events_for(&self, execution_id: i64) -> Vec<Event> {
        self.events
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(&self, draft: EventDraft) -> StoreResult<i64> {
        let mut events = self.events.write();
        let log = events.entry(draft.execution_id).or_default();

        if log.iter().any(|e| e.event_type.is_terminal()) {
            return Err(StoreError::TerminalRecorded(draft.execution_id));
        }

        let event_id = log.last().map(|e| e.event_id).unwrap_or(0) + 1;
        log.push(Event {
            execution_id: draft.execution_id,
            event_id,
            node_id: draft.node_id,
            parent_event_id: draft.parent_event_id,
            event_type: draft.event_type,
            status: draft.status,
            payload: sanitize(&draft.payload),
            error: draft.error,
            worker_id: draft.worker_id,
            attempt: draft.attempt,
            created_at: Utc::now(),
        });

        Ok(event_id)
    }

    async fn range(&self, execution_id: i64, after: Option<i64>) -> StoreResult<Vec<Event>> {
        let after = after.unwrap_or(0);
        Ok(self
            .events
            .read()
            .get(&execution_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.event_id > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn head(&self, execution_id: i64) -> StoreResult<Option<i64>> {
        Ok(self
            .events
            .read()
            .get(&execution_id)
            .and_then(|log| log.last())
            .map(|e| e.event_id))
    }
}

#[async_trait]
impl WorkQueue for MemoryStore {
    async fn enqueue(&self, draft: JobDraft) -> StoreResult<Option<i64>> {
        let mut jobs = self.jobs.write();

        let duplicate = jobs.values().any(|job| {
            job.execution_id == draft.execution_id
                && job.node_id == draft.node_id
                && job.attempt == draft.attempt
        });
        if duplicate {
            return Ok(None);
        }

        let queue_id = self.next_queue_id.fetch_add(1, Ordering::SeqCst) + 1;
        let available_at = Utc::now()
            + chrono::Duration::from_std(Duration::from_secs_f64(draft.delay.max(0.0)))
                .unwrap_or_else(|_| chrono::Duration::zero());

        jobs.insert(
            queue_id,
            Job {
                queue_id,
                execution_id: draft.execution_id,
                node_id: draft.node_id,
                kind: draft.kind,
                attempt: draft.attempt,
                action: draft.action,
                context: draft.context,
                status: JobStatus::Queued,
                attempts: 0,
                max_attempts: draft.max_attempts,
                priority: draft.priority,
                available_at,
                lease_deadline: None,
                worker_id: None,
            },
        );

        Ok(Some(queue_id))
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_jobs: i64,
        visibility: Duration,
    ) -> StoreResult<Vec<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();

        let mut leasable: Vec<i64> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.available_at <= now)
            .map(|job| job.queue_id)
            .collect();
        leasable.sort_by_key(|id| {
            let job = &jobs[id];
            (-job.priority, job.available_at, job.queue_id)
        });
        leasable.truncate(max_jobs.max(0) as usize);

        let deadline = now
            + chrono::Duration::from_std(visibility).unwrap_or_else(|_| chrono::Duration::zero());

        let mut leased = Vec::with_capacity(leasable.len());
        for queue_id in leasable {
            if let Some(job) = jobs.get_mut(&queue_id) {
                job.status = JobStatus::Leased;
                job.worker_id = Some(worker_id.to_string());
                job.lease_deadline = Some(deadline);
                job.attempts += 1;
                leased.push(job.clone());
            }
        }

        Ok(leased)
    }

    async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
        visibility: Duration,
    ) -> StoreResult<HeartbeatStatus> {
        let now = Utc::now();
        let execution_id = {
            let mut jobs = self.jobs.write();
            let job = match jobs.get_mut(&queue_id) {
                Some(job) => job,
                None => return Ok(HeartbeatStatus::Lost),
            };

            let held = job.status == JobStatus::Leased
                && job.worker_id.as_deref() == Some(worker_id)
                && job.lease_deadline.map(|d| d > now).unwrap_or(false);
            if !held {
                return Ok(HeartbeatStatus::Lost);
            }

            job.lease_deadline = Some(
                now + chrono::Duration::from_std(visibility)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
            );
            job.execution_id
        };

        if self.cancel_requested(execution_id).await? {
            Ok(HeartbeatStatus::CancelRequested)
        } else {
            Ok(HeartbeatStatus::Ok)
        }
    }

    async fn complete(&self, queue_id: i64) -> StoreResult<()> {
        if let Some(job) = self.jobs.write().get_mut(&queue_id) {
            job.status = JobStatus::Completed;
            job.lease_deadline = None;
        }
        Ok(())
    }

    async fn fail(&self, queue_id: i64, retry: bool, delay: Duration) -> StoreResult<FailOutcome> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&queue_id)
            .ok_or_else(|| StoreError::NotFound(format!("queue row {}", queue_id)))?;

        job.worker_id = None;
        job.lease_deadline = None;

        if !retry {
            job.status = JobStatus::Failed;
            return Ok(FailOutcome::Failed);
        }

        if job.attempts < job.max_attempts {
            let available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            job.status = JobStatus::Queued;
            job.available_at = available_at;
            Ok(FailOutcome::Requeued { available_at })
        } else {
            job.status = JobStatus::Dead;
            Ok(FailOutcome::Dead)
        }
    }

    async fn reap(&self) -> StoreResult<u64> {
        let now = Utc::now();
        let mut reclaimed = 0;
        for job in self.jobs.write().values_mut() {
            if job.status == JobStatus::Leased
                && job.lease_deadline.map(|d| d < now).unwrap_or(false)
            {
                job.worker_id = None;
                job.lease_deadline = None;
                job.status = if job.attempts >= job.max_attempts {
                    JobStatus::Dead
                } else {
                    JobStatus::Queued
                };
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn kill_execution(&self, execution_id: i64) -> StoreResult<u64> {
        let mut killed = 0;
        for job in self.jobs.write().values_mut() {
            if job.execution_id == execution_id && job.status == JobStatus::Queued {
                job.status = JobStatus::Dead;
                killed += 1;
            }
        }
        Ok(killed)
    }

    async fn kill_node_prefix(&self, execution_id: i64, prefix: &str) -> StoreResult<u64> {
        let mut killed = 0;
        for job in self.jobs.write().values_mut() {
            if job.execution_id == execution_id
                && job.status == JobStatus::Queued
                && job.node_id.starts_with(prefix)
            {
                job.status = JobStatus::Dead;
                killed += 1;
            }
        }
        Ok(killed)
    }

    async fn requeue_dead(&self, queue_id: i64) -> StoreResult<()> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&queue_id)
            .ok_or_else(|| StoreError::NotFound(format!("queue row {}", queue_id)))?;
        if job.status != JobStatus::Dead {
            return Err(StoreError::NotFound(format!("dead queue row {}", queue_id)));
        }
        job.status = JobStatus::Queued;
        job.attempts = 0;
        job.available_at = Utc::now();
        job.worker_id = None;
        job.lease_deadline = None;
        Ok(())
    }
}

#[async_trait]
impl BrokerState for MemoryStore {
    async fn allocate_execution_id(&self) -> StoreResult<i64> {
        Ok(self.next_execution_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn register_execution(
        &self,
        execution_id: i64,
        parent_execution_id: Option<i64>,
        parent_step: Option<&str>,
    ) -> StoreResult<()> {
        let mut cursors = self.cursors.write();
        cursors.entry(execution_id).or_insert_with(|| CursorRow {
            parent: parent_execution_id
                .zip(parent_step.map(|s| s.to_string())),
            ..CursorRow::default()
        });
        Ok(())
    }

    async fn claim(&self, execution_id: i64, broker_id: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let mut cursors = self.cursors.write();
        let row = match cursors.get_mut(&execution_id) {
            Some(row) => row,
            None => return Ok(false),
        };

        let free = match (&row.locked_by, row.locked_until) {
            (None, _) => true,
            (Some(holder), _) if holder == broker_id => true,
            (_, Some(until)) => until < now,
            _ => false,
        };
        if !free {
            return Ok(false);
        }

        row.locked_by = Some(broker_id.to_string());
        row.locked_until =
            Some(now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()));
        Ok(true)
    }

    async fn release(&self, execution_id: i64, broker_id: &str) -> StoreResult<()> {
        if let Some(row) = self.cursors.write().get_mut(&execution_id) {
            if row.locked_by.as_deref() == Some(broker_id) {
                row.locked_by = None;
                row.locked_until = None;
            }
        }
        Ok(())
    }

    async fn cursor(&self, execution_id: i64) -> StoreResult<i64> {
        Ok(self
            .cursors
            .read()
            .get(&execution_id)
            .map(|row| row.last_event_id)
            .unwrap_or(0))
    }

    async fn advance_cursor(&self, execution_id: i64, event_id: i64) -> StoreResult<()> {
        if let Some(row) = self.cursors.write().get_mut(&execution_id) {
            row.last_event_id = row.last_event_id.max(event_id);
        }
        Ok(())
    }

    async fn dirty_executions(&self, limit: i64) -> StoreResult<Vec<i64>> {
        let now = Utc::now();
        let events = self.events.read();
        let cursors = self.cursors.read();

        let mut dirty: Vec<i64> = cursors
            .iter()
            .filter(|(execution_id, row)| {
                let free = row.locked_until.map(|until| until < now).unwrap_or(true);
                let head = events
                    .get(execution_id)
                    .and_then(|log| log.last())
                    .map(|e| e.event_id)
                    .unwrap_or(0);
                free && head > row.last_event_id
            })
            .map(|(execution_id, _)| *execution_id)
            .collect();

        dirty.sort_unstable();
        dirty.truncate(limit.max(0) as usize);
        Ok(dirty)
    }

    async fn request_cancel(&self, execution_id: i64) -> StoreResult<()> {
        if let Some(row) = self.cursors.write().get_mut(&execution_id) {
            row.cancel_requested = true;
        }
        Ok(())
    }

    async fn cancel_requested(&self, execution_id: i64) -> StoreResult<bool> {
        Ok(self
            .cursors
            .read()
            .get(&execution_id)
            .map(|row| row.cancel_requested)
            .unwrap_or(false))
    }

    async fn children(&self, execution_id: i64) -> StoreResult<Vec<i64>> {
        let mut children: Vec<i64> = self
            .cursors
            .read()
            .iter()
            .filter(|(_, row)| {
                row.parent
                    .as_ref()
                    .map(|(parent, _)| *parent == execution_id)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        children.sort_unstable();
        Ok(children)
    }

    async fn parent(&self, execution_id: i64) -> StoreResult<Option<(i64, String)>> {
        Ok(self
            .cursors
            .read()
            .get(&execution_id)
            .and_then(|row| row.parent.clone()))
    }
}

#[async_trait]
impl PlaybookCatalog for MemoryStore {
    async fn register(&self, path: &str, content: &str) -> StoreResult<CatalogEntry> {
        let mut catalog = self.catalog.write();
        let version = catalog
            .iter()
            .filter(|entry| entry.path == path)
            .map(|entry| entry.version)
            .max()
            .unwrap_or(0)
            + 1;

        let entry = CatalogEntry {
            catalog_id: self.next_catalog_id.fetch_add(1, Ordering::SeqCst) + 1,
            path: path.to_string(),
            version,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        catalog.push(entry.clone());
        Ok(entry)
    }

    async fn fetch(&self, path: &str, version: Option<i32>) -> StoreResult<Option<CatalogEntry>> {
        let catalog = self.catalog.read();
        Ok(catalog
            .iter()
            .filter(|entry| entry.path == path)
            .filter(|entry| version.map(|v| entry.version == v).unwrap_or(true))
            .max_by_key(|entry| entry.version)
            .cloned())
    }

    async fn list(&self) -> StoreResult<Vec<CatalogEntry>> {
        let catalog = self.catalog.read();
        let mut latest: HashMap<&str, &CatalogEntry> = HashMap::new();
        for entry in catalog.iter() {
            let keep = latest
                .get(entry.path.as_str())
                .map(|existing| entry.version > existing.version)
                .unwrap_or(true);
            if keep {
                latest.insert(entry.path.as_str(), entry);
            }
        }
        let mut entries: Vec<CatalogEntry> = latest.values().map(|e| (*e).clone()).collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

#[async_trait]
impl CredentialResolver for MemoryStore {
    async fn resolve(&self, key: &str) -> StoreResult<Option<Credential>> {
        Ok(self.credentials.read().get(key).map(|(kind, fields)| {
            Credential {
                kind: kind.clone(),
                fields: fields
                    .iter()
                    .map(|(field, value)| (field.clone(), Sensitive::new(value.clone())))
                    .collect(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_core::event::EventType;
    use floe_core::job::{TaskSpec, ToolCall};
    use floe_core::playbook::types::ToolKind;

    fn draft(execution_id: i64, event_type: EventType) -> EventDraft {
        EventDraft::new(execution_id, event_type)
    }

    fn job_draft(execution_id: i64, node: &str, attempt: i32) -> JobDraft {
        let task = TaskSpec::new(ToolCall {
            kind: ToolKind::Noop,
            args: serde_json::Value::Null,
        });
        JobDraft::new(execution_id, node, &task).attempt(attempt)
    }

    #[tokio::test]
    async fn test_append_assigns_dense_event_ids() {
        let store = MemoryStore::new();
        assert_eq!(
            store.append(draft(1, EventType::PlaybookStarted)).await.unwrap(),
            1
        );
        assert_eq!(
            store
                .append(draft(1, EventType::StepStarted).node("start"))
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.head(1).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_append_after_terminal_rejected() {
        let store = MemoryStore::new();
        store.append(draft(1, EventType::PlaybookStarted)).await.unwrap();
        store
            .append(draft(1, EventType::PlaybookCompleted))
            .await
            .unwrap();

        let err = store
            .append(draft(1, EventType::StepStarted).node("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalRecorded(1)));

        // State unchanged
        assert_eq!(store.head(1).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_append_sanitizes_payload() {
        let store = MemoryStore::new();
        store
            .append(
                draft(1, EventType::PlaybookStarted)
                    .payload(serde_json::json!({"workload": {"password": "hunter2"}})),
            )
            .await
            .unwrap();

        let events = store.events_for(1);
        assert_eq!(events[0].payload["workload"]["password"], "[REDACTED]");
    }

    #[tokio::test]
    async fn test_enqueue_uniqueness_key() {
        let store = MemoryStore::new();
        let first = store.enqueue(job_draft(1, "a", 1)).await.unwrap();
        assert!(first.is_some());

        let duplicate = store.enqueue(job_draft(1, "a", 1)).await.unwrap();
        assert!(duplicate.is_none());

        let next_attempt = store.enqueue(job_draft(1, "a", 2)).await.unwrap();
        assert!(next_attempt.is_some());
    }

    #[tokio::test]
    async fn test_lease_exclusivity() {
        let store = MemoryStore::new();
        store.enqueue(job_draft(1, "a", 1)).await.unwrap();

        let first = store
            .lease("w1", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempts, 1);

        let second = store
            .lease("w2", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_priority_and_fifo_ordering() {
        let store = MemoryStore::new();
        store.enqueue(job_draft(1, "low", 1)).await.unwrap();
        store
            .enqueue(job_draft(1, "high", 1).priority(5))
            .await
            .unwrap();
        store.enqueue(job_draft(1, "low2", 1)).await.unwrap();

        let leased = store
            .lease("w1", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(leased[0].node_id, "high");
        assert_eq!(leased[1].node_id, "low");
        assert_eq!(leased[2].node_id, "low2");
    }

    #[tokio::test]
    async fn test_delayed_job_not_leasable() {
        let store = MemoryStore::new();
        store
            .enqueue(job_draft(1, "later", 1).delay(60.0))
            .await
            .unwrap();

        let leased = store
            .lease("w1", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(leased.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_lost_after_release() {
        let store = MemoryStore::new();
        store.enqueue(job_draft(1, "a", 1)).await.unwrap();
        let leased = store
            .lease("w1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        let queue_id = leased[0].queue_id;

        assert_eq!(
            store
                .heartbeat(queue_id, "w1", Duration::from_secs(30))
                .await
                .unwrap(),
            HeartbeatStatus::Ok
        );
        assert_eq!(
            store
                .heartbeat(queue_id, "w2", Duration::from_secs(30))
                .await
                .unwrap(),
            HeartbeatStatus::Lost
        );

        store.complete(queue_id).await.unwrap();
        assert_eq!(
            store
                .heartbeat(queue_id, "w1", Duration::from_secs(30))
                .await
                .unwrap(),
            HeartbeatStatus::Lost
        );
    }

    #[tokio::test]
    async fn test_heartbeat_reports_cancel() {
        let store = MemoryStore::new();
        store.register_execution(1, None, None).await.unwrap();
        store.enqueue(job_draft(1, "a", 1)).await.unwrap();
        let leased = store
            .lease("w1", 1, Duration::from_secs(30))
            .await
            .unwrap();

        store.request_cancel(1).await.unwrap();
        assert_eq!(
            store
                .heartbeat(leased[0].queue_id, "w1", Duration::from_secs(30))
                .await
                .unwrap(),
            HeartbeatStatus::CancelRequested
        );
    }

    #[tokio::test]
    async fn test_fail_with_retry_requeues_until_budget() {
        let store = MemoryStore::new();
        let mut draft = job_draft(1, "a", 1);
        draft.max_attempts = 2;
        store.enqueue(draft).await.unwrap();

        let leased = store
            .lease("w1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        let queue_id = leased[0].queue_id;

        let outcome = store
            .fail(queue_id, true, Duration::from_secs(0))
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Requeued { .. }));

        store.lease("w1", 1, Duration::from_secs(30)).await.unwrap();
        let outcome = store
            .fail(queue_id, true, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Dead);
    }

    #[tokio::test]
    async fn test_requeue_dead() {
        let store = MemoryStore::new();
        let mut draft = job_draft(1, "a", 1);
        draft.max_attempts = 1;
        store.enqueue(draft).await.unwrap();

        let leased = store
            .lease("w1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        let queue_id = leased[0].queue_id;
        store.fail(queue_id, true, Duration::from_secs(0)).await.unwrap();

        store.requeue_dead(queue_id).await.unwrap();
        let leased = store
            .lease("w1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
    }

    #[tokio::test]
    async fn test_broker_slot_claim() {
        let store = MemoryStore::new();
        store.register_execution(1, None, None).await.unwrap();

        assert!(store.claim(1, "b1", Duration::from_secs(30)).await.unwrap());
        assert!(!store.claim(1, "b2", Duration::from_secs(30)).await.unwrap());
        // Re-entrant for the holder
        assert!(store.claim(1, "b1", Duration::from_secs(30)).await.unwrap());

        store.release(1, "b1").await.unwrap();
        assert!(store.claim(1, "b2", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_dirty_executions() {
        let store = MemoryStore::new();
        store.register_execution(1, None, None).await.unwrap();
        store.register_execution(2, None, None).await.unwrap();

        store.append(draft(1, EventType::PlaybookStarted)).await.unwrap();
        assert_eq!(store.dirty_executions(10).await.unwrap(), vec![1]);

        store.advance_cursor(1, 1).await.unwrap();
        assert!(store.dirty_executions(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catalog_versioning() {
        let store = MemoryStore::new();
        let v1 = store.register("etl/daily", "one").await.unwrap();
        let v2 = store.register("etl/daily", "two").await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let latest = store.fetch("etl/daily", None).await.unwrap().unwrap();
        assert_eq!(latest.content, "two");
        let pinned = store.fetch("etl/daily", Some(1)).await.unwrap().unwrap();
        assert_eq!(pinned.content, "one");
    }

    #[tokio::test]
    async fn test_children_registry() {
        let store = MemoryStore::new();
        store.register_execution(1, None, None).await.unwrap();
        store
            .register_execution(2, Some(1), Some("run_child"))
            .await
            .unwrap();

        assert_eq!(store.children(1).await.unwrap(), vec![2]);
        assert_eq!(
            store.parent(2).await.unwrap(),
            Some((1, "run_child".to_string()))
        );
    }
}
