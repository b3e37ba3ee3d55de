//! Floe Store
//!
//! Durable services shared by brokers and workers:
//!
//! - **Event log**: append-only, per-execution ordered, terminal-guarded
//! - **Work queue**: leasable jobs with `FOR UPDATE SKIP LOCKED` claims,
//!   heartbeats, backoff re-enqueue, and a dead-letter state
//! - **Broker state**: execution registry, slot leases, cursors, cancellation
//! - **Catalog**: versioned playbook storage
//! - **Credentials**: AES-256-GCM encrypted at rest, `Sensitive` on the way out
//!
//! Contracts live in [`api`]; [`postgres::PgStore`] is the production
//! implementation and [`memory::MemoryStore`] the in-process one for tests.

pub mod api;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod schema;

pub use api::{
    BrokerState, CatalogEntry, Credential, CredentialResolver, EventLog, FailOutcome,
    HeartbeatStatus, PlaybookCatalog, WorkQueue,
};
pub use config::DatabaseConfig;
pub use credentials::{CredentialInfo, CredentialStore};
pub use crypto::Encryptor;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use pool::{create_pool, health_check, DbPool};
pub use postgres::PgStore;
pub use schema::ensure_schema;
