//! PostgreSQL implementation of the store contracts.
//!
//! One `PgStore` wraps the pool and implements the event log, the work
//! queue, and the broker bookkeeping. Appends are serialized per execution
//! with a transaction-scoped advisory lock; leasing uses an atomic
//! `FOR UPDATE SKIP LOCKED` claim; broker slots are compare-and-set leases
//! on the cursor row.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use floe_core::error::ActionError;
use floe_core::event::{Event, EventDraft, EventStatus, EventType};
use floe_core::job::{Job, JobDraft, JobKind, JobStatus};
use floe_core::sanitize::sanitize;

use crate::api::{
    BrokerState, CatalogEntry, EventLog, FailOutcome, HeartbeatStatus, PlaybookCatalog, WorkQueue,
};
use crate::error::{StoreError, StoreResult};
use crate::pool::DbPool;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    /// Create a store over an existing pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

const EVENT_COLUMNS: &str = "execution_id, event_id, node_id, parent_event_id, event_type, \
                             status, payload, error, worker_id, attempt, created_at";

const JOB_COLUMNS: &str = "queue_id, execution_id, node_id, kind, attempt, action, context, \
                           status, attempts, max_attempts, priority, available_at, \
                           lease_deadline, worker_id";

fn row_to_event(row: &sqlx::postgres::PgRow) -> StoreResult<Event> {
    let event_type: String = row.try_get("event_type")?;
    let status: String = row.try_get("status")?;
    let error: Option<serde_json::Value> = row.try_get("error")?;

    Ok(Event {
        execution_id: row.try_get("execution_id")?,
        event_id: row.try_get("event_id")?,
        node_id: row.try_get("node_id")?,
        parent_event_id: row.try_get("parent_event_id")?,
        event_type: EventType::from_str(&event_type)?,
        status: EventStatus::from(status.as_str()),
        payload: row.try_get("payload")?,
        error: error
            .map(|v| serde_json::from_value::<ActionError>(v))
            .transpose()?,
        worker_id: row.try_get("worker_id")?,
        attempt: row.try_get("attempt")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> StoreResult<Job> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;

    Ok(Job {
        queue_id: row.try_get("queue_id")?,
        execution_id: row.try_get("execution_id")?,
        node_id: row.try_get("node_id")?,
        kind: JobKind::from_str(&kind)?,
        attempt: row.try_get("attempt")?,
        action: row.try_get("action")?,
        context: row.try_get("context")?,
        status: JobStatus::from_str(&status)?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        priority: row.try_get("priority")?,
        available_at: row.try_get("available_at")?,
        lease_deadline: row.try_get("lease_deadline")?,
        worker_id: row.try_get("worker_id")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl EventLog for PgStore {
    async fn append(&self, draft: EventDraft) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;

        // Serialize appends per execution so event_id is dense and strictly
        // increasing; the lock is released at commit.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(draft.execution_id)
            .execute(&mut *tx)
            .await?;

        let terminal: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT event_id FROM floe.event
            WHERE execution_id = $1
              AND event_type IN ('playbook_completed', 'playbook_failed')
            LIMIT 1
            "#,
        )
        .bind(draft.execution_id)
        .fetch_optional(&mut *tx)
        .await?;

        if terminal.is_some() {
            return Err(StoreError::TerminalRecorded(draft.execution_id));
        }

        let head: (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(event_id), 0) FROM floe.event WHERE execution_id = $1")
                .bind(draft.execution_id)
                .fetch_one(&mut *tx)
                .await?;
        let event_id = head.0 + 1;

        let payload = sanitize(&draft.payload);
        let error = draft
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let insert = sqlx::query(
            r#"
            INSERT INTO floe.event (
                execution_id, event_id, node_id, parent_event_id, event_type,
                status, payload, error, worker_id, attempt, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(draft.execution_id)
        .bind(event_id)
        .bind(&draft.node_id)
        .bind(draft.parent_event_id)
        .bind(draft.event_type.as_str())
        .bind(draft.status.to_string())
        .bind(&payload)
        .bind(&error)
        .bind(&draft.worker_id)
        .bind(draft.attempt)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        if let Err(err) = insert {
            if is_unique_violation(&err) {
                return Err(StoreError::DuplicateEvent {
                    execution_id: draft.execution_id,
                    event_id,
                });
            }
            return Err(err.into());
        }

        tx.commit().await?;
        Ok(event_id)
    }

    async fn range(&self, execution_id: i64, after: Option<i64>) -> StoreResult<Vec<Event>> {
        let query = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM floe.event
            WHERE execution_id = $1 AND event_id > $2
            ORDER BY event_id ASC
            "#
        );
        let rows = sqlx::query(&query)
            .bind(execution_id)
            .bind(after.unwrap_or(0))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn head(&self, execution_id: i64) -> StoreResult<Option<i64>> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(event_id) FROM floe.event WHERE execution_id = $1")
                .bind(execution_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl WorkQueue for PgStore {
    async fn enqueue(&self, draft: JobDraft) -> StoreResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO floe.queue (
                execution_id, node_id, kind, attempt, action, context,
                max_attempts, priority, available_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8,
                    now() + ($9::float8 * interval '1 second'))
            ON CONFLICT (execution_id, node_id, attempt) DO NOTHING
            RETURNING queue_id
            "#,
        )
        .bind(draft.execution_id)
        .bind(&draft.node_id)
        .bind(draft.kind.to_string())
        .bind(draft.attempt)
        .bind(&draft.action)
        .bind(&draft.context)
        .bind(draft.max_attempts)
        .bind(draft.priority)
        .bind(draft.delay)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_jobs: i64,
        visibility: Duration,
    ) -> StoreResult<Vec<Job>> {
        let query = format!(
            r#"
            WITH leasable AS (
                SELECT queue_id
                FROM floe.queue
                WHERE status = 'queued' AND available_at <= now()
                ORDER BY priority DESC, available_at, queue_id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE floe.queue q
            SET status = 'leased',
                worker_id = $2,
                lease_deadline = now() + ($3::float8 * interval '1 second'),
                attempts = attempts + 1
            FROM leasable l
            WHERE q.queue_id = l.queue_id
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&query)
            .bind(max_jobs)
            .bind(worker_id)
            .bind(visibility.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;

        let jobs: StoreResult<Vec<Job>> = rows.iter().map(row_to_job).collect();
        let jobs = jobs?;
        if !jobs.is_empty() {
            tracing::debug!(worker_id, count = jobs.len(), "Leased jobs");
        }
        Ok(jobs)
    }

    async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
        visibility: Duration,
    ) -> StoreResult<HeartbeatStatus> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE floe.queue
            SET lease_deadline = now() + ($3::float8 * interval '1 second')
            WHERE queue_id = $1
              AND worker_id = $2
              AND status = 'leased'
              AND lease_deadline > now()
            RETURNING execution_id
            "#,
        )
        .bind(queue_id)
        .bind(worker_id)
        .bind(visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let execution_id = match row {
            Some((execution_id,)) => execution_id,
            None => return Ok(HeartbeatStatus::Lost),
        };

        if self.cancel_requested(execution_id).await? {
            Ok(HeartbeatStatus::CancelRequested)
        } else {
            Ok(HeartbeatStatus::Ok)
        }
    }

    async fn complete(&self, queue_id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE floe.queue SET status = 'completed', lease_deadline = NULL WHERE queue_id = $1",
        )
        .bind(queue_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, queue_id: i64, retry: bool, delay: Duration) -> StoreResult<FailOutcome> {
        if !retry {
            sqlx::query(
                r#"
                UPDATE floe.queue
                SET status = 'failed', worker_id = NULL, lease_deadline = NULL
                WHERE queue_id = $1
                "#,
            )
            .bind(queue_id)
            .execute(&self.pool)
            .await?;
            return Ok(FailOutcome::Failed);
        }

        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            UPDATE floe.queue
            SET status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'dead' END,
                available_at = CASE
                    WHEN attempts < max_attempts
                    THEN now() + ($2::float8 * interval '1 second')
                    ELSE available_at
                END,
                worker_id = NULL,
                lease_deadline = NULL
            WHERE queue_id = $1
            RETURNING status, available_at
            "#,
        )
        .bind(queue_id)
        .bind(delay.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((status, available_at)) if status == "queued" => {
                Ok(FailOutcome::Requeued { available_at })
            }
            Some(_) => Ok(FailOutcome::Dead),
            None => Err(StoreError::NotFound(format!("queue row {}", queue_id))),
        }
    }

    async fn reap(&self) -> StoreResult<u64> {
        let rows = sqlx::query(
            r#"
            WITH expired AS (
                SELECT queue_id
                FROM floe.queue
                WHERE status = 'leased' AND lease_deadline < now()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE floe.queue q
            SET status = CASE WHEN q.attempts >= q.max_attempts THEN 'dead' ELSE 'queued' END,
                worker_id = NULL,
                lease_deadline = NULL
            FROM expired e
            WHERE q.queue_id = e.queue_id
            RETURNING q.queue_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let reclaimed = rows.len() as u64;
        if reclaimed > 0 {
            tracing::warn!(count = reclaimed, "Reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    async fn kill_execution(&self, execution_id: i64) -> StoreResult<u64> {
        let result =
            sqlx::query("UPDATE floe.queue SET status = 'dead' WHERE execution_id = $1 AND status = 'queued'")
                .bind(execution_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn kill_node_prefix(&self, execution_id: i64, prefix: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE floe.queue
            SET status = 'dead'
            WHERE execution_id = $1
              AND status = 'queued'
              AND left(node_id, length($2)) = $2
            "#,
        )
        .bind(execution_id)
        .bind(prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_dead(&self, queue_id: i64) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE floe.queue
            SET status = 'queued',
                attempts = 0,
                available_at = now(),
                worker_id = NULL,
                lease_deadline = NULL
            WHERE queue_id = $1 AND status = 'dead'
            "#,
        )
        .bind(queue_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "dead queue row {}",
                queue_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerState for PgStore {
    async fn allocate_execution_id(&self) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT nextval('floe.execution_seq')")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    async fn register_execution(
        &self,
        execution_id: i64,
        parent_execution_id: Option<i64>,
        parent_step: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO floe.execution_cursor (execution_id, parent_execution_id, parent_step)
            VALUES ($1, $2, $3)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(execution_id)
        .bind(parent_execution_id)
        .bind(parent_step)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim(&self, execution_id: i64, broker_id: &str, ttl: Duration) -> StoreResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE floe.execution_cursor
            SET locked_by = $2,
                locked_until = now() + ($3::float8 * interval '1 second'),
                updated_at = now()
            WHERE execution_id = $1
              AND (locked_by IS NULL OR locked_by = $2 OR locked_until < now())
            RETURNING execution_id
            "#,
        )
        .bind(execution_id)
        .bind(broker_id)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release(&self, execution_id: i64, broker_id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE floe.execution_cursor
            SET locked_by = NULL, locked_until = NULL, updated_at = now()
            WHERE execution_id = $1 AND locked_by = $2
            "#,
        )
        .bind(execution_id)
        .bind(broker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cursor(&self, execution_id: i64) -> StoreResult<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_event_id FROM floe.execution_cursor WHERE execution_id = $1")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id).unwrap_or(0))
    }

    async fn advance_cursor(&self, execution_id: i64, event_id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE floe.execution_cursor
            SET last_event_id = GREATEST(last_event_id, $2), updated_at = now()
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dirty_executions(&self, limit: i64) -> StoreResult<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT c.execution_id
            FROM floe.execution_cursor c
            WHERE (c.locked_until IS NULL OR c.locked_until < now())
              AND EXISTS (
                  SELECT 1 FROM floe.event e
                  WHERE e.execution_id = c.execution_id
                    AND e.event_id > c.last_event_id
              )
            ORDER BY c.updated_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn request_cancel(&self, execution_id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE floe.execution_cursor SET cancel_requested = TRUE, updated_at = now() WHERE execution_id = $1",
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_requested(&self, execution_id: i64) -> StoreResult<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT cancel_requested FROM floe.execution_cursor WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(flag,)| flag).unwrap_or(false))
    }

    async fn children(&self, execution_id: i64) -> StoreResult<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT execution_id FROM floe.execution_cursor WHERE parent_execution_id = $1",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn parent(&self, execution_id: i64) -> StoreResult<Option<(i64, String)>> {
        let row: Option<(Option<i64>, Option<String>)> = sqlx::query_as(
            "SELECT parent_execution_id, parent_step FROM floe.execution_cursor WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(parent, step)| parent.zip(step)))
    }
}

#[async_trait]
impl PlaybookCatalog for PgStore {
    async fn register(&self, path: &str, content: &str) -> StoreResult<CatalogEntry> {
        let row: (i64, String, i32, String, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO floe.catalog (path, version, content)
            VALUES ($1, (SELECT COALESCE(MAX(version), 0) + 1 FROM floe.catalog WHERE path = $1), $2)
            RETURNING catalog_id, path, version, content, created_at
            "#,
        )
        .bind(path)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;

        Ok(CatalogEntry {
            catalog_id: row.0,
            path: row.1,
            version: row.2,
            content: row.3,
            created_at: row.4,
        })
    }

    async fn fetch(&self, path: &str, version: Option<i32>) -> StoreResult<Option<CatalogEntry>> {
        let row: Option<(i64, String, i32, String, DateTime<Utc>)> = match version {
            Some(version) => {
                sqlx::query_as(
                    r#"
                    SELECT catalog_id, path, version, content, created_at
                    FROM floe.catalog
                    WHERE path = $1 AND version = $2
                    "#,
                )
                .bind(path)
                .bind(version)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT catalog_id, path, version, content, created_at
                    FROM floe.catalog
                    WHERE path = $1
                    ORDER BY version DESC
                    LIMIT 1
                    "#,
                )
                .bind(path)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(row.map(|(catalog_id, path, version, content, created_at)| CatalogEntry {
            catalog_id,
            path,
            version,
            content,
            created_at,
        }))
    }

    async fn list(&self) -> StoreResult<Vec<CatalogEntry>> {
        let rows: Vec<(i64, String, i32, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (path) catalog_id, path, version, content, created_at
            FROM floe.catalog
            ORDER BY path, version DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(catalog_id, path, version, content, created_at)| CatalogEntry {
                catalog_id,
                path,
                version,
                content,
                created_at,
            })
            .collect())
    }
}

impl PgStore {
    /// Register a worker or refresh its registration.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        pool_name: &str,
        hostname: Option<&str>,
        capacity: Option<i32>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO floe.worker (worker_id, pool_name, hostname, capacity, status, heartbeat)
            VALUES ($1, $2, $3, $4, 'active', now())
            ON CONFLICT (worker_id) DO UPDATE SET
                pool_name = EXCLUDED.pool_name,
                hostname = EXCLUDED.hostname,
                capacity = EXCLUDED.capacity,
                status = 'active',
                heartbeat = now()
            "#,
        )
        .bind(worker_id)
        .bind(pool_name)
        .bind(hostname)
        .bind(capacity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh a worker heartbeat.
    pub async fn worker_heartbeat(&self, worker_id: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE floe.worker SET heartbeat = now() WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("worker {}", worker_id)));
        }
        Ok(())
    }

    /// Mark a worker stopped.
    pub async fn deregister_worker(&self, worker_id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE floe.worker SET status = 'stopped' WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove workers whose heartbeat is older than the threshold.
    pub async fn cleanup_stale_workers(&self, stale_after: Duration) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM floe.worker WHERE heartbeat < now() - ($1::float8 * interval '1 second')",
        )
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
