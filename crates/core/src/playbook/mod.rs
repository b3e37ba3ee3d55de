//! Playbook graph: types, parsing, validation.

pub mod parser;
pub mod types;

pub use parser::{parse, validate};
pub use types::{
    CollectSpec, CollectStrategy, ErrorRetryPolicy, FailPolicy, LoopMode, LoopSpec, Metadata,
    PaginationPolicy, Playbook, RetrySpec, SinkFailurePolicy, SinkSpec, Step, ToolKind, ToolSpec,
    Transition, END_STEP, START_STEP,
};
