use crate::ipc::{write_atomic, RunStore, StepPaths};
use crate::model::{
    truncate_error, OutputStatus, StepInput, StepName, StepOutcome, StepOutput, StepResult,
    WorkflowState, WorkflowStatus,
};
use agentflow_core::{AgentFlowError, AgentFlowResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory of persisted workflow state files, one JSON per workflow.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Base directory of per-task run artifacts.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    /// How many times one step may be re-attempted after failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How many times the reviewer may send the chain back to the writer.
    #[serde(default = "default_max_reworks")]
    pub max_reworks: u32,
    /// Wall-clock budget of a single step, in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("workflow_states")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("agent_runs")
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_reworks() -> u32 {
    2
}

fn default_step_timeout_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            run_dir: default_run_dir(),
            max_retries: default_max_retries(),
            max_reworks: default_max_reworks(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// The step timeout as a [`Duration`].
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Raw result of invoking an agent process for one step.
#[derive(Debug, Clone)]
pub struct StepExecution {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Runs one step of the chain against an agent.
///
/// The runner receives the step's artifact paths; the agent (or the runner
/// on its behalf) is expected to leave its verdict in `paths.output`.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute one step.
    async fn run(
        &self,
        step: StepName,
        prompt: &str,
        paths: &StepPaths,
    ) -> AgentFlowResult<StepExecution>;
}

/// Runner that fabricates a success output for every step, used for dry
/// runs and demos.
pub struct SimulatedRunner;

#[async_trait]
impl StepRunner for SimulatedRunner {
    async fn run(
        &self,
        step: StepName,
        _prompt: &str,
        paths: &StepPaths,
    ) -> AgentFlowResult<StepExecution> {
        let output = StepOutput::success(
            serde_json::json!({ "step": step.to_string(), "simulated": true }),
            format!("simulated {step} run"),
        );
        write_atomic(&paths.output, &serde_json::to_string_pretty(&output)?).await?;
        Ok(StepExecution {
            exit_code: 0,
            stdout: format!("simulated {step} run"),
            stderr: String::new(),
        })
    }
}

/// Receives workflow lifecycle notifications. All methods default to no-ops.
#[async_trait]
pub trait WorkflowObserver: Send + Sync {
    /// A workflow began executing.
    async fn workflow_started(&self, _state: &WorkflowState) {}
    /// A step is about to run.
    async fn step_started(&self, _task_id: &str, _step: StepName) {}
    /// A step finished (any outcome).
    async fn step_ended(&self, _task_id: &str, _result: &StepResult) {}
    /// The workflow reached a terminal state or was stopped.
    async fn workflow_ended(&self, _state: &WorkflowState) {}
}

struct NullObserver;

#[async_trait]
impl WorkflowObserver for NullObserver {}

/// Compact history entry inside a [`WorkflowSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Which step ran.
    pub step: StepName,
    /// How it ended.
    pub outcome: StepOutcome,
    /// When it finished.
    pub completed_at: DateTime<Utc>,
}

/// Status snapshot of one workflow, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    /// Workflow task id.
    pub task_id: String,
    /// What the workflow is trying to accomplish.
    pub task_description: String,
    /// Workflow-level status.
    pub status: WorkflowStatus,
    /// The step currently pending or running, if any.
    pub current_step: Option<StepName>,
    /// Consecutive failures of the current step.
    pub retry_count: u32,
    /// Reviewer rejections so far.
    pub rework_count: u32,
    /// Steps that ended in success.
    pub steps_completed: usize,
    /// Length of the standard chain.
    pub total_steps: usize,
    /// When the workflow started.
    pub created_at: DateTime<Utc>,
    /// When the record was last persisted.
    pub last_updated: DateTime<Utc>,
    /// One line per history entry.
    pub history: Vec<HistoryEntry>,
}

impl WorkflowSummary {
    fn from_state(state: &WorkflowState) -> Self {
        Self {
            task_id: state.task_id.clone(),
            task_description: state.task_description.clone(),
            status: state.status,
            current_step: state.current_step,
            retry_count: state.retry_count,
            rework_count: state.rework_count,
            steps_completed: state.steps_completed(),
            total_steps: StepName::chain().len(),
            created_at: state.created_at,
            last_updated: state.last_updated,
            history: state
                .history
                .iter()
                .map(|r| HistoryEntry {
                    step: r.step_name,
                    outcome: r.outcome,
                    completed_at: r.completed_at,
                })
                .collect(),
        }
    }
}

/// The sequential 5-step workflow state machine.
///
/// Drives one workflow at a time through planner → writer → reviewer →
/// tester → analyzer, persisting after every transition so a restarted
/// process can pick up where it left off.
pub struct WorkflowEngine {
    config: EngineConfig,
    store: RunStore,
    runner: Arc<dyn StepRunner>,
    stop_requested: AtomicBool,
}

impl WorkflowEngine {
    /// Create an engine from configuration and a step runner.
    pub fn new(config: EngineConfig, runner: Arc<dyn StepRunner>) -> Self {
        let store = RunStore::new(config.run_dir.clone());
        Self {
            config,
            store,
            runner,
            stop_requested: AtomicBool::new(false),
        }
    }

    /// The run artifact store.
    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Ask the execute loop to break between steps.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Register a new workflow, or return the existing in-flight one.
    ///
    /// A terminal record under the same id is replaced by a fresh run.
    pub async fn start(
        &self,
        task_id: Option<String>,
        task_description: &str,
    ) -> AgentFlowResult<WorkflowState> {
        let task_id = task_id.unwrap_or_else(new_workflow_id);

        if let Some(existing) = self.load_state(&task_id).await? {
            if !existing.status.is_terminal() {
                warn!(%task_id, status = ?existing.status, "Workflow already in flight");
                return Ok(existing);
            }
        }

        let state = WorkflowState::new(task_id.clone(), task_description);
        self.store
            .save_task_definition(&task_id, task_description)
            .await?;
        self.save_state(&state).await?;
        info!(%task_id, "Workflow registered");
        Ok(state)
    }

    /// Execute a workflow to its terminal state (or until stopped).
    pub async fn execute(&self, task_id: &str) -> AgentFlowResult<WorkflowState> {
        self.execute_observed(task_id, &NullObserver).await
    }

    /// Execute a workflow, notifying `observer` at each lifecycle point.
    pub async fn execute_observed(
        &self,
        task_id: &str,
        observer: &dyn WorkflowObserver,
    ) -> AgentFlowResult<WorkflowState> {
        let mut state = self
            .load_state(task_id)
            .await?
            .ok_or_else(|| AgentFlowError::Workflow(format!("unknown workflow: {task_id}")))?;

        if state.status.is_terminal() {
            warn!(task_id, status = ?state.status, "Workflow already terminal");
            return Ok(state);
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        observer.workflow_started(&state).await;

        state.status = WorkflowStatus::Dispatching;
        self.save_state(&state).await?;

        while let Some(step) = state.current_step {
            if self.stop_requested.load(Ordering::SeqCst) {
                warn!(task_id, step = %step, "Stop requested, leaving workflow between steps");
                break;
            }

            state.status = WorkflowStatus::for_step(step);
            self.save_state(&state).await?;
            observer.step_started(task_id, step).await;
            info!(task_id, step = %step, attempt = state.retry_count + 1, "Running step");

            let result = self.run_step(&state, step).await?;
            state.history.push(result.clone());
            observer.step_ended(task_id, &result).await;

            self.transition(&mut state, step, &result);
            self.save_state(&state).await?;

            if state.status.is_terminal() {
                break;
            }
        }

        observer.workflow_ended(&state).await;
        info!(task_id, status = ?state.status, "Workflow execution finished");
        Ok(state)
    }

    /// Run one step and classify its outcome. Only infrastructure failures
    /// (filesystem, serialization) surface as errors; agent failures become
    /// a `Failure` result.
    async fn run_step(&self, state: &WorkflowState, step: StepName) -> AgentFlowResult<StepResult> {
        let task_id = state.task_id.as_str();
        let paths = self.store.step_paths(task_id, step).await?;

        // The most recent parsed output, whatever its verdict: a rework
        // hands the reviewer's rejection feedback to the writer.
        let previous = state.history.iter().rev().find_map(|r| r.output.as_ref());

        let input = StepInput {
            task_id: state.task_id.clone(),
            task_description: state.task_description.clone(),
            step_name: step.to_string(),
            previous_step_output: previous.map(|o| o.payload.clone()),
            context: None,
        };
        self.store.write_step_input(task_id, step, &input).await?;
        let prompt = self
            .store
            .agent_prompt(task_id, step, &state.task_description, previous);

        let started_at = Utc::now();
        let mut result = StepResult {
            step_name: step,
            outcome: StepOutcome::Failure,
            started_at,
            completed_at: started_at,
            input_path: paths.input.display().to_string(),
            output_path: paths.output.display().to_string(),
            exit_code: -1,
            output: None,
            error_log_path: None,
            error_message: None,
        };

        let run = tokio::time::timeout(
            self.config.step_timeout(),
            self.runner.run(step, &prompt, &paths),
        )
        .await;
        result.completed_at = Utc::now();

        match run {
            Err(_) => {
                result.outcome = StepOutcome::TimedOut;
                result.error_message = Some(format!(
                    "step timed out after {}s",
                    self.config.step_timeout_secs
                ));
                error!(task_id, step = %step, "Step timed out");
            }
            Ok(Err(e)) => {
                result.error_message = Some(truncate_error(&e.to_string()));
                error!(task_id, step = %step, error = %e, "Step runner failed");
            }
            Ok(Ok(execution)) => {
                result.exit_code = execution.exit_code;
                if !execution.stderr.is_empty() {
                    let log = self
                        .store
                        .write_step_stderr(task_id, step, &execution.stderr)
                        .await?;
                    result.error_log_path = Some(log.display().to_string());
                }

                if execution.exit_code != 0 {
                    let detail = if execution.stderr.is_empty() {
                        &execution.stdout
                    } else {
                        &execution.stderr
                    };
                    result.error_message = Some(truncate_error(detail));
                    error!(task_id, step = %step, exit_code = execution.exit_code, "Step exited non-zero");
                } else {
                    match self.store.read_step_output(task_id, step).await {
                        None => {
                            result.error_message =
                                Some("missing or malformed output file".to_string());
                        }
                        Some(output) => {
                            result.outcome = match output.status {
                                OutputStatus::Success => StepOutcome::Success,
                                OutputStatus::Rejected => StepOutcome::Rejected,
                                OutputStatus::Failure => StepOutcome::Failure,
                            };
                            if output.status == OutputStatus::Failure {
                                result.error_message =
                                    output.message.as_deref().map(truncate_error);
                            }
                            result.output = Some(output);
                        }
                    }
                }
            }
        }

        result.completed_at = Utc::now();
        debug!(task_id, step = %step, outcome = ?result.outcome, "Step classified");
        Ok(result)
    }

    /// Apply the transition table to one step outcome.
    fn transition(&self, state: &mut WorkflowState, step: StepName, result: &StepResult) {
        match result.outcome {
            StepOutcome::Success => match step.next() {
                Some(next) => {
                    state.current_step = Some(next);
                    state.retry_count = 0;
                    state.status = WorkflowStatus::Dispatching;
                }
                None => {
                    state.status = WorkflowStatus::Completed;
                    state.current_step = None;
                    info!(task_id = %state.task_id, "Workflow completed");
                }
            },
            StepOutcome::Rejected if step == StepName::Reviewer => {
                if state.rework_count < self.config.max_reworks {
                    // retry_count deliberately survives the rework, so one
                    // retry budget bounds the whole rework cycle.
                    state.rework_count += 1;
                    state.current_step = Some(StepName::Writer);
                    state.status = WorkflowStatus::PendingRework;
                    warn!(
                        task_id = %state.task_id,
                        rework = state.rework_count,
                        "Reviewer rejected, rewinding to writer"
                    );
                } else {
                    state.status = WorkflowStatus::Failed;
                    state.current_step = None;
                    error!(task_id = %state.task_id, "Rework budget exhausted");
                }
            }
            // A rejection off the reviewer, a failure, or a timeout all
            // spend one retry of the same step.
            StepOutcome::Rejected | StepOutcome::Failure | StepOutcome::TimedOut
            | StepOutcome::Skipped => {
                if state.retry_count < self.config.max_retries {
                    state.retry_count += 1;
                    state.status = WorkflowStatus::Dispatching;
                    warn!(
                        task_id = %state.task_id,
                        step = %step,
                        retry = state.retry_count,
                        "Step failed, retrying"
                    );
                } else {
                    state.status = WorkflowStatus::InDlq;
                    state.current_step = None;
                    error!(
                        task_id = %state.task_id,
                        step = %step,
                        "Retry budget exhausted, dead-lettering workflow"
                    );
                }
            }
        }
        state.touch();
    }

    /// Status snapshot of one workflow.
    pub async fn status(&self, task_id: &str) -> AgentFlowResult<Option<WorkflowSummary>> {
        Ok(self
            .load_state(task_id)
            .await?
            .map(|s| WorkflowSummary::from_state(&s)))
    }

    /// All known workflows, newest first, optionally filtered by status.
    /// Malformed state files are logged and skipped.
    pub async fn list(
        &self,
        filter: Option<WorkflowStatus>,
    ) -> AgentFlowResult<Vec<WorkflowSummary>> {
        if !self.config.state_dir.exists() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.state_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable state file");
                    continue;
                }
            };
            let state: WorkflowState = match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed state file");
                    continue;
                }
            };
            if filter.map_or(true, |wanted| wanted == state.status) {
                summaries.push(WorkflowSummary::from_state(&state));
            }
        }

        summaries.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(summaries)
    }

    fn state_path(&self, task_id: &str) -> PathBuf {
        self.config.state_dir.join(format!("{task_id}.json"))
    }

    /// Persist one workflow record, full overwrite via temp file + rename.
    pub async fn save_state(&self, state: &WorkflowState) -> AgentFlowResult<()> {
        tokio::fs::create_dir_all(&self.config.state_dir).await?;
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.state_path(&state.task_id), &json).await?;
        Ok(())
    }

    /// Load one workflow record; `None` when no file exists.
    pub async fn load_state(&self, task_id: &str) -> AgentFlowResult<Option<WorkflowState>> {
        let path = self.state_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// Generate a short workflow task id.
pub fn new_workflow_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("task-{}", &hex[..8])
}
