//! Schema bootstrap.
//!
//! The store owns its DDL: `ensure_schema` executes idempotent statements
//! on startup so a fresh database is usable without external migration
//! tooling.

use crate::error::StoreResult;
use crate::pool::DbPool;

/// Idempotent DDL statements, executed in order.
const DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS floe",
    "CREATE SEQUENCE IF NOT EXISTS floe.execution_seq",
    r#"
    CREATE TABLE IF NOT EXISTS floe.event (
        execution_id    BIGINT NOT NULL,
        event_id        BIGINT NOT NULL,
        node_id         TEXT,
        parent_event_id BIGINT,
        event_type      TEXT NOT NULL,
        status          TEXT NOT NULL,
        payload         JSONB NOT NULL DEFAULT 'null'::jsonb,
        error           JSONB,
        worker_id       TEXT,
        attempt         INTEGER,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (execution_id, event_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS event_terminal_idx
        ON floe.event (execution_id)
        WHERE event_type IN ('playbook_completed', 'playbook_failed')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS floe.queue (
        queue_id       BIGSERIAL PRIMARY KEY,
        execution_id   BIGINT NOT NULL,
        node_id        TEXT NOT NULL,
        kind           TEXT NOT NULL DEFAULT 'action',
        attempt        INTEGER NOT NULL DEFAULT 1,
        action         JSONB NOT NULL,
        context        JSONB NOT NULL DEFAULT 'null'::jsonb,
        status         TEXT NOT NULL DEFAULT 'queued',
        attempts       INTEGER NOT NULL DEFAULT 0,
        max_attempts   INTEGER NOT NULL DEFAULT 5,
        priority       INTEGER NOT NULL DEFAULT 0,
        available_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        lease_deadline TIMESTAMPTZ,
        worker_id      TEXT,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (execution_id, node_id, attempt)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_lease_idx
        ON floe.queue (status, available_at, priority)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS floe.execution_cursor (
        execution_id        BIGINT PRIMARY KEY,
        last_event_id       BIGINT NOT NULL DEFAULT 0,
        locked_by           TEXT,
        locked_until        TIMESTAMPTZ,
        cancel_requested    BOOLEAN NOT NULL DEFAULT FALSE,
        parent_execution_id BIGINT,
        parent_step         TEXT,
        created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at          TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS execution_cursor_parent_idx
        ON floe.execution_cursor (parent_execution_id)
        WHERE parent_execution_id IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS floe.catalog (
        catalog_id BIGSERIAL PRIMARY KEY,
        path       TEXT NOT NULL,
        version    INTEGER NOT NULL,
        content    TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (path, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS floe.credential (
        name       TEXT PRIMARY KEY,
        kind       TEXT NOT NULL,
        payload    BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS floe.worker (
        worker_id  TEXT PRIMARY KEY,
        pool_name  TEXT NOT NULL,
        hostname   TEXT,
        capacity   INTEGER,
        status     TEXT NOT NULL DEFAULT 'active',
        heartbeat  TIMESTAMPTZ NOT NULL DEFAULT now(),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// Apply the schema. Safe to run on every startup.
pub async fn ensure_schema(pool: &DbPool) -> StoreResult<()> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = DDL.len(), "Schema ensured");
    Ok(())
}
