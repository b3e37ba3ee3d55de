//! Floe Worker
//!
//! The worker runtime: leases jobs from the durable queue, renders tool
//! calls over the job context, resolves credentials, invokes executors
//! under deadline and cancellation, and streams results back as events.

pub mod config;
pub mod executor;
pub mod runtime;

pub use config::WorkerConfig;
pub use executor::{JobOutcome, JobProcessor};
pub use runtime::WorkerRuntime;
