use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Steps of the standard workflow chain, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    /// Decomposes the task into an implementation plan.
    Planner,
    /// Implements the plan.
    Writer,
    /// Reviews the implementation; may reject back to the writer.
    Reviewer,
    /// Writes and runs tests.
    Tester,
    /// Summarizes the whole run.
    Analyzer,
}

impl StepName {
    /// The standard chain order.
    pub fn chain() -> [StepName; 5] {
        [
            StepName::Planner,
            StepName::Writer,
            StepName::Reviewer,
            StepName::Tester,
            StepName::Analyzer,
        ]
    }

    /// The successor step in the chain, or `None` for the final step.
    pub fn next(self) -> Option<StepName> {
        match self {
            StepName::Planner => Some(StepName::Writer),
            StepName::Writer => Some(StepName::Reviewer),
            StepName::Reviewer => Some(StepName::Tester),
            StepName::Tester => Some(StepName::Analyzer),
            StepName::Analyzer => None,
        }
    }

    /// External CLI command bound to this step.
    pub fn command(self) -> &'static str {
        match self {
            StepName::Planner => "gemini",
            StepName::Writer => "claude",
            StepName::Reviewer => "claude",
            StepName::Tester => "codex",
            StepName::Analyzer => "gemini",
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepName::Planner => write!(f, "planner"),
            StepName::Writer => write!(f, "writer"),
            StepName::Reviewer => write!(f, "reviewer"),
            StepName::Tester => write!(f, "tester"),
            StepName::Analyzer => write!(f, "analyzer"),
        }
    }
}

/// Workflow-level execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Created, not yet dispatched.
    Queued,
    /// Between steps: the next step is about to run.
    Dispatching,
    /// The planner step is executing.
    RunningPlanner,
    /// The writer step is executing.
    RunningWriter,
    /// The reviewer step is executing.
    RunningReviewer,
    /// The tester step is executing.
    RunningTester,
    /// The analyzer step is executing.
    RunningAnalyzer,
    /// The reviewer rejected; the chain is rewound to the writer.
    PendingRework,
    /// Terminal: every step succeeded.
    Completed,
    /// Terminal: the rework budget was exhausted.
    Failed,
    /// Terminal: timed out.
    TimedOut,
    /// Terminal: the retry budget was exhausted; requires manual handling.
    InDlq,
}

impl WorkflowStatus {
    /// The RUNNING_<step> status for a step.
    pub fn for_step(step: StepName) -> WorkflowStatus {
        match step {
            StepName::Planner => WorkflowStatus::RunningPlanner,
            StepName::Writer => WorkflowStatus::RunningWriter,
            StepName::Reviewer => WorkflowStatus::RunningReviewer,
            StepName::Tester => WorkflowStatus::RunningTester,
            StepName::Analyzer => WorkflowStatus::RunningAnalyzer,
        }
    }

    /// Whether this status is terminal and permanent.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::TimedOut
                | WorkflowStatus::InDlq
        )
    }
}

/// Outcome of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step produced a valid success output.
    Success,
    /// The step failed (non-zero exit, missing or malformed output).
    Failure,
    /// The reviewer rejected the work product.
    Rejected,
    /// The step did not finish within the step timeout.
    TimedOut,
    /// The step was never started because the workflow stopped first.
    Skipped,
}

/// Status field of a step's `output.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    /// The agent completed its step.
    Success,
    /// The agent (reviewer) rejected the work product.
    Rejected,
    /// The agent reported a failure.
    Failure,
}

/// Standardized output written by an agent to `output.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    /// Success / rejected / failure verdict.
    pub status: OutputStatus,
    /// Step-specific result payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Human-readable summary.
    pub message: Option<String>,
    /// Reviewer feedback on rejection.
    pub feedback: Option<String>,
}

impl StepOutput {
    /// A success output with the given payload and message.
    pub fn success(payload: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Success,
            payload,
            message: Some(message.into()),
            feedback: None,
        }
    }

    /// A failure output with the given payload and message.
    pub fn failure(payload: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Failure,
            payload,
            message: Some(message.into()),
            feedback: None,
        }
    }

    /// Whether the agent rejected the work product.
    pub fn is_rejected(&self) -> bool {
        self.status == OutputStatus::Rejected
    }
}

/// Input handed to an agent through `input.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    /// Workflow task id.
    pub task_id: String,
    /// What the workflow is trying to accomplish.
    pub task_description: String,
    /// Which step this input is for.
    pub step_name: String,
    /// Output payload of the previous successful step, if any.
    pub previous_step_output: Option<serde_json::Value>,
    /// Extra caller context.
    pub context: Option<serde_json::Value>,
}

/// Result of one step execution, appended to the workflow history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Which step ran.
    pub step_name: StepName,
    /// How it ended.
    pub outcome: StepOutcome,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub completed_at: DateTime<Utc>,
    /// Path of the step's `input.json`.
    pub input_path: String,
    /// Path of the step's `output.json`.
    pub output_path: String,
    /// Process exit code of the agent.
    pub exit_code: i32,
    /// Parsed output, when one was readable.
    pub output: Option<StepOutput>,
    /// Path of the step's `stderr.log`, when stderr was produced.
    pub error_log_path: Option<String>,
    /// Truncated error text, when the step failed.
    pub error_message: Option<String>,
}

/// Maximum stored length of a step's error text.
pub const ERROR_MESSAGE_LIMIT: usize = 500;

/// Truncate error text to [`ERROR_MESSAGE_LIMIT`] characters on a char
/// boundary.
pub fn truncate_error(text: &str) -> String {
    text.chars().take(ERROR_MESSAGE_LIMIT).collect()
}

/// The persisted record of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Unique task identifier.
    pub task_id: String,
    /// What this workflow is trying to accomplish.
    pub task_description: String,
    /// Workflow-level status.
    pub status: WorkflowStatus,
    /// The step that will run (or is running) next; `None` once terminal.
    pub current_step: Option<StepName>,
    /// Ordered, append-only step results.
    #[serde(default)]
    pub history: Vec<StepResult>,
    /// Consecutive failures of the current step; resets on step advance,
    /// deliberately not on rework.
    #[serde(default)]
    pub retry_count: u32,
    /// How many times the reviewer has sent the chain back to the writer.
    #[serde(default)]
    pub rework_count: u32,
    /// When the workflow was started.
    pub created_at: DateTime<Utc>,
    /// When the record was last persisted.
    pub last_updated: DateTime<Utc>,
}

impl WorkflowState {
    /// A fresh workflow, queued at the planner step.
    pub fn new(task_id: impl Into<String>, task_description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            task_description: task_description.into(),
            status: WorkflowStatus::Queued,
            current_step: Some(StepName::Planner),
            history: Vec::new(),
            retry_count: 0,
            rework_count: 0,
            created_at: now,
            last_updated: now,
        }
    }

    /// Output payload of the most recent successful step, if any.
    pub fn last_output(&self) -> Option<&StepOutput> {
        self.history
            .iter()
            .rev()
            .find(|r| r.outcome == StepOutcome::Success)
            .and_then(|r| r.output.as_ref())
    }

    /// Number of successful steps in the history.
    pub fn steps_completed(&self) -> usize {
        self.history
            .iter()
            .filter(|r| r.outcome == StepOutcome::Success)
            .count()
    }

    /// Bump the `last_updated` timestamp.
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}
