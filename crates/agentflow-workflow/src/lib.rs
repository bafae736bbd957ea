//! Workflow execution for AgentFlow.
//!
//! Two execution shapes share one data model:
//!
//! - [`engine::WorkflowEngine`] drives the standard sequential 5-step chain
//!   (planner → writer → reviewer → tester → analyzer) with retry, rework,
//!   and dead-letter semantics, persisting state after every transition.
//! - [`parallel::ParallelExecutor`] runs an arbitrary [`graph::WorkflowGraph`]
//!   group by group under a concurrency cap.
//!
//! Agents communicate through files managed by [`ipc::RunStore`]: the engine
//! writes `input.json`, the agent leaves `output.json`, diagnostics land in
//! `stderr.log`.

/// Sequential 5-step workflow state machine.
pub mod engine;
/// Workflow DAG with ready-set and topological ordering.
pub mod graph;
/// File-based hand-off between the engine and agents.
pub mod ipc;
/// Workflow, step, and output data structures.
pub mod model;
/// Group-by-group concurrent graph execution.
pub mod parallel;

pub use engine::{
    EngineConfig, SimulatedRunner, StepExecution, StepRunner, WorkflowEngine, WorkflowObserver,
    WorkflowSummary,
};
pub use graph::{GraphConfig, GraphNode, NodeStatus, WorkflowGraph};
pub use ipc::{RunStore, StepPaths};
pub use model::{
    OutputStatus, StepInput, StepName, StepOutcome, StepOutput, StepResult, WorkflowState,
    WorkflowStatus,
};
pub use parallel::{ExecutionReport, ParallelExecutor, StepExecutor};
