use crate::task::{Task, TaskStatus};
use agentflow_core::{AgentFlowError, AgentFlowResult};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Per-status counters for the queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Total number of tasks held, in any status.
    pub total: usize,
    /// Tasks waiting to run.
    pub pending: usize,
    /// Tasks currently executing.
    pub running: usize,
    /// Tasks that finished successfully.
    pub completed: usize,
    /// Tasks that finished unsuccessfully.
    pub failed: usize,
    /// Tasks cancelled before running.
    pub cancelled: usize,
}

/// Capacity-bounded in-memory task queue with priority ordering.
///
/// Tasks are ordered by priority (HIGH before NORMAL before LOW) and then by
/// submission time. The struct itself is not synchronized; callers share it
/// behind a single `Arc<RwLock<TaskQueue>>` so that no task is ever partially
/// visible to two callers.
pub struct TaskQueue {
    tasks: HashMap<String, Task>,
    max_size: usize,
}

impl TaskQueue {
    /// Create a queue that holds at most `max_size` tasks.
    pub fn new(max_size: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            max_size,
        }
    }

    /// Add a task to the queue.
    ///
    /// Fails with [`AgentFlowError::Capacity`] when the queue is full.
    pub fn submit(&mut self, task: Task) -> AgentFlowResult<()> {
        if self.tasks.len() >= self.max_size {
            return Err(AgentFlowError::Capacity(format!(
                "task queue is full (max={})",
                self.max_size
            )));
        }
        info!(task_id = %task.id, role = %task.target_role, "Task submitted");
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Get a task by id.
    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Overwrite a task record by id. Idempotent; unknown ids are ignored.
    pub fn update(&mut self, task: Task) {
        if self.tasks.contains_key(&task.id) {
            debug!(task_id = %task.id, status = ?task.status, "Task updated");
            self.tasks.insert(task.id.clone(), task);
        }
    }

    /// Tasks that are ready to run: status `Pending` and every dependency id
    /// resolves to a `Completed` task. Sorted by (priority rank, created_at).
    ///
    /// A task referencing a dependency id that never resolves simply never
    /// appears here; it stays observable via [`Self::get_tasks_by_status`].
    pub fn get_runnable_tasks(&self) -> Vec<Task> {
        let mut runnable: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.dependencies.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|d| d.status == TaskStatus::Completed)
                })
            })
            .cloned()
            .collect();
        sort_by_priority(&mut runnable);
        runnable
    }

    /// All pending tasks, sorted by priority.
    pub fn get_pending_tasks(&self) -> Vec<Task> {
        self.get_tasks_by_status(TaskStatus::Pending)
    }

    /// All tasks with the given status, sorted by priority.
    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        sort_by_priority(&mut tasks);
        tasks
    }

    /// All tasks in submission order.
    pub fn get_all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Remove a task by id. Returns whether it existed.
    pub fn remove(&mut self, task_id: &str) -> bool {
        self.tasks.remove(task_id).is_some()
    }

    /// Remove all `Completed` and `Cancelled` tasks. Returns the count removed.
    pub fn clear_completed(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| {
            !matches!(t.status, TaskStatus::Completed | TaskStatus::Cancelled)
        });
        let removed = before - self.tasks.len();
        info!(removed, "Cleared completed tasks");
        removed
    }

    /// Cancel a pending task. Running tasks have no forced-cancellation
    /// contract and are left untouched.
    pub fn cancel(&mut self, task_id: &str) -> bool {
        match self.tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                task.updated_at = Utc::now();
                info!(task_id, "Task cancelled");
                true
            }
            _ => false,
        }
    }

    /// Per-status counters.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.tasks.len(),
            ..QueueStats::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Number of tasks held, in any status.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the queue holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn sort_by_priority(tasks: &mut [Task]) {
    tasks.sort_by_key(|t| (t.priority.rank(), t.created_at));
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(100)
    }
}
