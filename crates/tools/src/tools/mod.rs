//! Built-in executor implementations.
//!
//! - `http` - HTTP requests
//! - `sql` - PostgreSQL queries
//! - `code` - Rhai scripts
//! - `shell` - shell commands
//! - `file` - local file storage (sink target)
//! - `noop` - pass-through

mod code;
mod file;
mod http;
mod noop;
mod shell;
mod sql;

pub use self::code::CodeTool;
pub use self::file::FileTool;
pub use self::http::{HttpArgs, HttpAuth, HttpMethod, HttpTool};
pub use self::noop::NoopTool;
pub use self::shell::{ShellArgs, ShellTool};
pub use self::sql::{SqlArgs, SqlTool};

use crate::registry::ToolRegistry;

/// Create a registry with all built-in executors registered.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(HttpTool::new());
    registry.register(SqlTool::new());
    registry.register(CodeTool::new());
    registry.register(ShellTool::new());
    registry.register(FileTool::new());
    registry.register(NoopTool::new());

    registry
}
