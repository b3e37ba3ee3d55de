//! Floe Tools
//!
//! Executor plugin library for the Floe worker runtime. Tools implement a
//! narrow interface (execute + cancellation) behind a registry keyed by the
//! closed tool-kind set, and return a normalized result envelope.

pub mod context;
pub mod error;
pub mod registry;
pub mod result;
pub mod tools;

pub use context::ToolContext;
pub use error::ToolError;
pub use registry::{Tool, ToolRegistry};
pub use result::{ToolResult, ToolStatus};
pub use tools::create_default_registry;
