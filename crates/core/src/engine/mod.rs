//! Orchestration engine: state reconstruction, transition evaluation,
//! retry control, job construction, and the pure decision core.

pub mod commands;
pub mod evaluator;
pub mod orchestrator;
pub mod retry;
pub mod state;

pub use commands::CommandBuilder;
pub use evaluator::ConditionEvaluator;
pub use orchestrator::{ChildSpawn, Decision, KillSet, Orchestrator};
pub use retry::{ErrorDecision, PageDecision};
pub use state::{
    ExecutionState, FailureCause, IteratorFrame, StepInfo, StepState, WorkflowState,
};
