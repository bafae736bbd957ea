//! Core error definitions for the agentflow orchestration engine.
//!
//! This crate provides the error type shared across all agentflow crates.
//!
//! # Main types
//!
//! - [`AgentFlowError`] — Unified error enum for all agentflow subsystems.
//! - [`AgentFlowResult`] — Convenience alias for `Result<T, AgentFlowError>`.

/// Top-level error type for the agentflow orchestration engine.
///
/// Configuration-class errors are fatal at setup time and must not be
/// retried; everything that can happen during normal step execution is
/// represented as a typed outcome at the dispatch/executor boundary instead
/// of an error variant here.
#[derive(Debug, thiserror::Error)]
pub enum AgentFlowError {
    /// Invalid setup: unknown role or agent, malformed or cyclic DAG.
    #[error("Config error: {0}")]
    Config(String),

    /// The task queue rejected a submission because it is at capacity.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// An error from the workflow state machine (e.g. unknown workflow id).
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// An error reported by an agent's execution capability.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error from the task scheduler or dispatch loop.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error, typically from state persistence.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`AgentFlowError`].
pub type AgentFlowResult<T> = Result<T, AgentFlowError>;
