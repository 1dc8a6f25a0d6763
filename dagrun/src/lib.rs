//! DAG execution engine.
//!
//! Compiles task declarations into layered plans, runs layers with bounded
//! parallelism, resolves `$task.path` references between tasks, and
//! supports cooperative pauses (validation gates, dependency approvals,
//! human checkpoints) with resumable pending workflows.

pub mod dispatch;
pub mod engine;
pub mod pending;
pub mod plan;
pub mod reference;
pub mod speculation;
pub mod state;
pub mod suggest;
pub mod task;
pub mod trace;

pub use dispatch::{CodeRequest, TaskDispatcher};
pub use engine::{
    DagEngine, DependencyDecision, EngineConfig, ExecutionOutcome, PauseTicket, ResumeInput,
    RetryPolicy, SubmitOptions, WorkflowResult,
};
pub use pending::{PauseKind, PendingStore};
pub use plan::CompiledPlan;
pub use speculation::SpeculationConfig;
pub use state::{WorkflowMode, WorkflowState};
pub use suggest::{SuggestConfig, SuggestedPlan, Suggester, SuggestionSource};
pub use task::{parse_task_specs, TaskKind, TaskRecord, TaskSpec, TaskStatus};
pub use trace::{EngineEvent, TraceEvent, TraceKind};
