use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Submitted, waiting for dependencies and an available agent.
    Pending,
    /// Dispatched to an agent and currently executing.
    Running,
    /// Finished successfully; `result` holds the agent's payload.
    Completed,
    /// Finished unsuccessfully; `error` holds the reason.
    Failed,
    /// Cancelled before it started running.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (the task will never run again).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Priority levels for tasks. Higher priority sorts first among runnable tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    /// Dispatched before normal and low priority tasks.
    High,
    /// Default priority.
    Normal,
    /// Dispatched only after high and normal priority tasks.
    Low,
}

impl TaskPriority {
    /// Sort rank: lower ranks dispatch first.
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Normal => 1,
            TaskPriority::Low => 2,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// A unit of work bound to a capability role, executed by one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque task identifier (`task-` plus 8 hex chars).
    pub id: String,
    /// Human-readable description of the work.
    pub description: String,
    /// Capability role required to execute this task (planner, writer, ...).
    pub target_role: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Dispatch priority.
    pub priority: TaskPriority,
    /// Ids of tasks that must be `Completed` before this one may run.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Agent this task was dispatched to, once running.
    pub assigned_agent_id: Option<String>,
    /// Result payload reported by the agent on completion.
    pub result: Option<serde_json::Value>,
    /// Error text reported on failure.
    pub error: Option<String>,
    /// Arbitrary caller-supplied metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the task record was last mutated.
    pub updated_at: DateTime<Utc>,
    /// When the task started running, if it has.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state, if it has.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task for the given role.
    pub fn new(description: impl Into<String>, target_role: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_task_id(),
            description: description.into(),
            target_role: target_role.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            dependencies: Vec::new(),
            assigned_agent_id: None,
            result: None,
            error: None,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the dependency task ids.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Attach caller metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

fn new_task_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("task-{}", &hex[..8])
}

/// Status of a worker agent in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Ready to accept a task.
    Idle,
    /// Executing a task (`current_task_id` is set).
    Working,
    /// Last task failed; requires attention before reuse.
    Error,
    /// Process not reachable.
    Offline,
    /// Not yet observed.
    Unknown,
}

/// The directory's record of one worker agent.
///
/// Invariant: `current_task_id` is `Some` exactly when `status` is
/// [`AgentStatus::Working`]. All mutations go through the directory's named
/// transition methods, which maintain this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Opaque agent identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Port the agent's local service listens on.
    pub port: u16,
    /// Capability roles this agent can execute.
    pub roles: Vec<String>,
    /// Model or backend identifier, informational only.
    pub model: String,
    /// Current availability.
    pub status: AgentStatus,
    /// Task currently being executed, if any.
    pub current_task_id: Option<String>,
    /// Lifetime count of successfully completed tasks.
    #[serde(default)]
    pub tasks_completed: u64,
    /// Lifetime count of failed tasks.
    #[serde(default)]
    pub tasks_failed: u64,
    /// When the agent state was last touched.
    pub last_seen: DateTime<Utc>,
    /// Last error message, if the agent is in the `Error` state.
    pub error_message: Option<String>,
}

impl AgentState {
    /// Create a new agent record in the `Unknown` state.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        port: u16,
        roles: Vec<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            port,
            roles,
            model: model.into(),
            status: AgentStatus::Unknown,
            current_task_id: None,
            tasks_completed: 0,
            tasks_failed: 0,
            last_seen: Utc::now(),
            error_message: None,
        }
    }

    /// Start out idle instead of unknown.
    pub fn idle(mut self) -> Self {
        self.status = AgentStatus::Idle;
        self
    }

    /// Whether the agent can accept a new task right now.
    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    /// Whether the agent's role set contains `role` (exact string match).
    pub fn can_handle_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Implement auth module", "writer");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.target_role, "writer");
        assert!(task.id.starts_with("task-"));
        assert_eq!(task.id.len(), "task-".len() + 8);
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn test_task_builders() {
        let task = Task::new("t", "tester")
            .with_priority(TaskPriority::High)
            .with_dependencies(vec!["task-aaaa0000".to_string()]);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.dependencies.len(), 1);
    }

    #[test]
    fn test_priority_rank_order() {
        assert!(TaskPriority::High.rank() < TaskPriority::Normal.rank());
        assert!(TaskPriority::Normal.rank() < TaskPriority::Low.rank());
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_task_serialization_wire_values() {
        let task = Task::new("t", "planner").with_priority(TaskPriority::High);
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"PENDING\""));
        assert!(json.contains("\"HIGH\""));
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, TaskStatus::Pending);
        assert_eq!(parsed.priority, TaskPriority::High);
    }

    #[test]
    fn test_agent_availability() {
        let agent = AgentState::new("agent-1", "Writer One", 8101, vec!["writer".into()], "claude");
        assert!(!agent.is_available());

        let agent = agent.idle();
        assert!(agent.is_available());
        assert!(agent.can_handle_role("writer"));
        assert!(!agent.can_handle_role("tester"));
    }

    #[test]
    fn test_agent_state_serialization() {
        let agent =
            AgentState::new("agent-1", "Planner", 8100, vec!["planner".into()], "gemini").idle();
        let json = serde_json::to_string(&agent).unwrap();
        assert!(json.contains("\"IDLE\""));
        let parsed: AgentState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, AgentStatus::Idle);
        assert_eq!(parsed.port, 8100);
    }
}
