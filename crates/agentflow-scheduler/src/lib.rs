//! Priority- and dependency-aware task scheduling for multi-agent pipelines.
//!
//! This crate owns the task model, the capacity-bounded task queue, the
//! persisted agent directory, and the background dispatch loop that matches
//! runnable tasks to available agents by role.
//!
//! # Main types
//!
//! - [`Task`] / [`TaskStatus`] / [`TaskPriority`] — One unit of work and its lifecycle.
//! - [`TaskQueue`] — Priority queue with dependency resolution, shared behind one lock.
//! - [`AgentDirectory`] — Agent availability and assignment, persisted on every mutation.
//! - [`Dispatcher`] — Polling loop dispatching runnable tasks to idle agents.
//! - [`TaskExecutor`] — Injected capability that actually performs the work.

/// Agent directory with file-based persistence.
pub mod directory;
/// Background dispatch loop.
pub mod dispatcher;
/// Capacity-bounded priority task queue.
pub mod queue;
/// Task and agent state data structures.
pub mod task;

pub use directory::AgentDirectory;
pub use dispatcher::{Dispatcher, DispatcherConfig, TaskExecutor};
pub use queue::{QueueStats, TaskQueue};
pub use task::{AgentState, AgentStatus, Task, TaskPriority, TaskStatus};
