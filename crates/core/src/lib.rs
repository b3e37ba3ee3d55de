//! Floe Core
//!
//! Domain model and pure orchestration logic for the Floe playbook engine:
//!
//! - **Events**: the closed event-type set and the append-only record shape
//! - **Jobs**: durable queue rows and the serialized task they carry
//! - **Playbooks**: the workflow graph, its YAML form, and validation
//! - **Templates**: Jinja2-style rendering over the layered scope
//! - **State**: deterministic snapshot reconstruction from events
//! - **Decisions**: the broker's pure per-event decision procedure
//!
//! Everything here is side-effect free. Durability lives in `floe-store`,
//! I/O application in `floe-broker`, and execution in `floe-worker`.

pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod playbook;
pub mod sanitize;
pub mod sensitive;
pub mod template;

pub use context::Scope;
pub use error::{ActionError, CoreError, CoreResult, ErrorKind};
pub use event::{Event, EventDraft, EventStatus, EventType};
pub use job::{Job, JobDraft, JobKind, JobStatus, TaskSpec, ToolCall};
pub use sensitive::Sensitive;
