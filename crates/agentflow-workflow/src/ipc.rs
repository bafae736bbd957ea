use crate::model::{StepInput, StepName, StepOutput};
use agentflow_core::AgentFlowResult;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// File-based hand-off between the engine and the agent layer.
///
/// Directory structure per task:
///
/// ```text
/// <base_run_dir>/
/// └── <task_id>/
///     ├── task_definition.json
///     ├── planner/
///     │   ├── input.json
///     │   ├── output.json
///     │   └── stderr.log
///     ├── writer/
///     │   └── ...
///     └── ...
/// ```
pub struct RunStore {
    base_run_dir: PathBuf,
}

/// The three artifact paths of one step.
#[derive(Debug, Clone)]
pub struct StepPaths {
    /// `input.json` — what the agent receives.
    pub input: PathBuf,
    /// `output.json` — what the agent produces.
    pub output: PathBuf,
    /// `stderr.log` — free-text diagnostics.
    pub stderr: PathBuf,
}

impl RunStore {
    /// Create a run store rooted at `base_run_dir`.
    pub fn new(base_run_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_run_dir: base_run_dir.into(),
        }
    }

    /// Directory for one task's artifacts.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base_run_dir.join(task_id)
    }

    /// Directory for one step's artifacts, created on demand.
    pub async fn step_dir(&self, task_id: &str, step: StepName) -> AgentFlowResult<PathBuf> {
        let dir = self.task_dir(task_id).join(step.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// The input/output/stderr paths of one step.
    pub async fn step_paths(&self, task_id: &str, step: StepName) -> AgentFlowResult<StepPaths> {
        let dir = self.step_dir(task_id, step).await?;
        Ok(StepPaths {
            input: dir.join("input.json"),
            output: dir.join("output.json"),
            stderr: dir.join("stderr.log"),
        })
    }

    /// Write a step's `input.json`.
    pub async fn write_step_input(
        &self,
        task_id: &str,
        step: StepName,
        input: &StepInput,
    ) -> AgentFlowResult<PathBuf> {
        let paths = self.step_paths(task_id, step).await?;
        let json = serde_json::to_string_pretty(input)?;
        write_atomic(&paths.input, &json).await?;
        debug!(task_id, step = %step, "Prepared step input");
        Ok(paths.input)
    }

    /// Write a step's `output.json` (used by simulated agents and tests).
    pub async fn write_step_output(
        &self,
        task_id: &str,
        step: StepName,
        output: &StepOutput,
    ) -> AgentFlowResult<PathBuf> {
        let paths = self.step_paths(task_id, step).await?;
        let json = serde_json::to_string_pretty(output)?;
        write_atomic(&paths.output, &json).await?;
        Ok(paths.output)
    }

    /// Read and parse a step's `output.json`.
    ///
    /// A missing or malformed file yields `None`; the caller classifies that
    /// as a step failure rather than an error.
    pub async fn read_step_output(&self, task_id: &str, step: StepName) -> Option<StepOutput> {
        let dir = self.task_dir(task_id).join(step.to_string());
        let path = dir.join("output.json");
        if !path.exists() {
            warn!(task_id, step = %step, "Output file not found");
            return None;
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<StepOutput>(&content) {
                Ok(output) => Some(output),
                Err(e) => {
                    error!(task_id, step = %step, error = %e, "Failed to parse output file");
                    None
                }
            },
            Err(e) => {
                error!(task_id, step = %step, error = %e, "Error reading output file");
                None
            }
        }
    }

    /// Write a step's `stderr.log`.
    pub async fn write_step_stderr(
        &self,
        task_id: &str,
        step: StepName,
        content: &str,
    ) -> AgentFlowResult<PathBuf> {
        let paths = self.step_paths(task_id, step).await?;
        tokio::fs::write(&paths.stderr, content).await?;
        Ok(paths.stderr)
    }

    /// Read a step's `stderr.log`, if present.
    pub async fn read_step_stderr(&self, task_id: &str, step: StepName) -> Option<String> {
        let path = self.task_dir(task_id).join(step.to_string()).join("stderr.log");
        tokio::fs::read_to_string(&path).await.ok()
    }

    /// Record the original task definition under the task directory.
    pub async fn save_task_definition(
        &self,
        task_id: &str,
        task_description: &str,
    ) -> AgentFlowResult<PathBuf> {
        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join("task_definition.json");
        let doc = serde_json::json!({
            "task_id": task_id,
            "task_description": task_description,
            "created_at": Utc::now(),
        });
        write_atomic(&path, &serde_json::to_string_pretty(&doc)?).await?;
        Ok(path)
    }

    /// Collect the parsed outputs of every step that produced one.
    pub async fn all_step_outputs(
        &self,
        task_id: &str,
    ) -> Vec<(StepName, StepOutput)> {
        let mut outputs = Vec::new();
        for step in StepName::chain() {
            if let Some(output) = self.read_step_output(task_id, step).await {
                outputs.push((step, output));
            }
        }
        outputs
    }

    /// Remove a task's artifacts. With `keep_results`, only inputs and
    /// stderr logs are deleted and outputs are kept.
    pub async fn cleanup_task(&self, task_id: &str, keep_results: bool) -> AgentFlowResult<()> {
        let task_dir = self.task_dir(task_id);
        if !task_dir.exists() {
            return Ok(());
        }

        if keep_results {
            let mut entries = tokio::fs::read_dir(&task_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.path().is_dir() {
                    continue;
                }
                for name in ["input.json", "stderr.log"] {
                    let file = entry.path().join(name);
                    if file.exists() {
                        tokio::fs::remove_file(&file).await?;
                    }
                }
            }
        } else {
            tokio::fs::remove_dir_all(&task_dir).await?;
            debug!(task_id, "Removed task directory");
        }
        Ok(())
    }

    /// Build the prompt handed to the agent CLI for one step.
    pub fn agent_prompt(
        &self,
        task_id: &str,
        step: StepName,
        task_description: &str,
        previous_output: Option<&StepOutput>,
    ) -> String {
        let mut parts = vec![
            format!("[Task ID: {task_id}]"),
            format!("[Step: {}]", step.to_string().to_uppercase()),
            String::new(),
            "## Task Description".to_string(),
            task_description.to_string(),
        ];

        if let Some(previous) = previous_output {
            parts.push(String::new());
            parts.push("## Previous Step Output".to_string());
            parts.push(
                serde_json::to_string_pretty(&previous.payload)
                    .unwrap_or_else(|_| "{}".to_string()),
            );
        }

        parts.push(String::new());
        parts.push("## Instructions".to_string());
        parts.push(format!(
            "You are the {} agent in a multi-agent workflow.",
            step.to_string().to_uppercase()
        ));
        parts.push(step_instructions(step).to_string());

        parts.join("\n")
    }
}

fn step_instructions(step: StepName) -> &'static str {
    match step {
        StepName::Planner => "Analyze the task and create a detailed implementation plan.",
        StepName::Writer => "Implement the code based on the plan provided.",
        StepName::Reviewer => {
            "Review the code for quality, security, and best practices. \
             Output 'APPROVED' or 'REJECTED: <reason>' as your verdict."
        }
        StepName::Tester => "Write and execute tests for the implementation.",
        StepName::Analyzer => "Analyze the complete workflow results and provide a summary report.",
    }
}

/// Write `content` to `path` via a temp file and rename, so a crash mid-write
/// never leaves a torn file.
pub(crate) async fn write_atomic(path: &Path, content: &str) -> AgentFlowResult<()> {
    let tmp = path.with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
