//! End-to-end workflow tests.
//!
//! Drives the sequential engine and the parallel graph executor through the
//! public API with scripted agents, covering the completion, rework, and
//! dead-letter paths.

use agentflow_core::{AgentFlowError, AgentFlowResult};
use agentflow_workflow::{
    EngineConfig, GraphNode, OutputStatus, ParallelExecutor, SimulatedRunner, StepExecution,
    StepExecutor, StepName, StepOutcome, StepOutput, StepPaths, StepRunner, WorkflowEngine,
    WorkflowGraph, WorkflowStatus,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Replays a scripted sequence of agent behaviors, one per step invocation.
/// Past the end of the script every step succeeds.
struct ScriptedRunner {
    script: Mutex<Vec<Behavior>>,
}

#[derive(Clone, Copy)]
enum Behavior {
    Approve,
    Reject,
    Crash,
}

impl ScriptedRunner {
    fn new(script: Vec<Behavior>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
        })
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run(
        &self,
        step: StepName,
        _prompt: &str,
        paths: &StepPaths,
    ) -> AgentFlowResult<StepExecution> {
        let behavior = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Behavior::Approve
            } else {
                script.remove(0)
            }
        };

        match behavior {
            Behavior::Crash => Ok(StepExecution {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("{step} agent crashed"),
            }),
            Behavior::Reject => {
                let output = StepOutput {
                    status: OutputStatus::Rejected,
                    payload: serde_json::Value::Null,
                    message: Some("REJECTED: missing tests".into()),
                    feedback: Some("add unit tests".into()),
                };
                tokio::fs::write(&paths.output, serde_json::to_string_pretty(&output)?).await?;
                Ok(StepExecution {
                    exit_code: 0,
                    stdout: "REJECTED".into(),
                    stderr: String::new(),
                })
            }
            Behavior::Approve => {
                let output =
                    StepOutput::success(serde_json::json!({"step": step.to_string()}), "approved");
                tokio::fs::write(&paths.output, serde_json::to_string_pretty(&output)?).await?;
                Ok(StepExecution {
                    exit_code: 0,
                    stdout: "ok".into(),
                    stderr: String::new(),
                })
            }
        }
    }
}

fn engine_in(dir: &tempfile::TempDir, runner: Arc<dyn StepRunner>) -> WorkflowEngine {
    WorkflowEngine::new(
        EngineConfig {
            state_dir: dir.path().join("states"),
            run_dir: dir.path().join("runs"),
            ..EngineConfig::default()
        },
        runner,
    )
}

#[tokio::test]
async fn test_five_step_chain_completes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir, Arc::new(SimulatedRunner));

    engine.start(Some("wf-ok".into()), "ship a parser").await.unwrap();
    let done = engine.execute("wf-ok").await.unwrap();

    assert_eq!(done.status, WorkflowStatus::Completed);
    assert!(done.current_step.is_none());
    assert_eq!(done.history.len(), 5);

    let steps: Vec<_> = done.history.iter().map(|r| r.step_name).collect();
    assert_eq!(
        steps,
        vec![
            StepName::Planner,
            StepName::Writer,
            StepName::Reviewer,
            StepName::Tester,
            StepName::Analyzer,
        ]
    );

    // Artifacts exist on disk for every step.
    for (step, output) in engine.store().all_step_outputs("wf-ok").await {
        assert_eq!(output.status, OutputStatus::Success, "step {step}");
    }
}

#[tokio::test]
async fn test_reviewer_rejects_twice_then_approves() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new(vec![
        Behavior::Approve, // planner
        Behavior::Approve, // writer
        Behavior::Reject,  // reviewer -> rework 1
        Behavior::Approve, // writer
        Behavior::Reject,  // reviewer -> rework 2
        Behavior::Approve, // writer
        Behavior::Approve, // reviewer
        Behavior::Approve, // tester
        Behavior::Approve, // analyzer
    ]);
    let engine = engine_in(&dir, runner);

    engine.start(Some("wf-rework".into()), "demo").await.unwrap();
    let done = engine.execute("wf-rework").await.unwrap();

    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.rework_count, 2);
    assert!(done.current_step.is_none());

    // Two extra writer entries beyond the base chain.
    let writer_runs = done
        .history
        .iter()
        .filter(|r| r.step_name == StepName::Writer)
        .count();
    assert_eq!(writer_runs, 3);
    assert_eq!(done.history.len(), 9);
}

#[tokio::test]
async fn test_retry_budget_exhausts_to_dlq() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new(vec![Behavior::Crash; 20]);
    let engine = engine_in(&dir, runner);

    engine.start(Some("wf-dlq".into()), "demo").await.unwrap();
    let done = engine.execute("wf-dlq").await.unwrap();

    assert_eq!(done.status, WorkflowStatus::InDlq);
    assert!(done.current_step.is_none());
    // Exactly max_retries + 1 attempts of the planner, nothing else ran.
    assert_eq!(done.history.len(), 4);
    assert!(done
        .history
        .iter()
        .all(|r| r.step_name == StepName::Planner && r.outcome == StepOutcome::Failure));

    // The record is visible through the listing surface.
    let dlq = engine.list(Some(WorkflowStatus::InDlq)).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].task_id, "wf-dlq");
}

/// Graph executor backed by a table of canned payloads.
struct TableExecutor {
    executed: Mutex<Vec<String>>,
}

#[async_trait]
impl StepExecutor for TableExecutor {
    async fn execute(
        &self,
        node: &GraphNode,
        upstream: &BTreeMap<String, serde_json::Value>,
    ) -> AgentFlowResult<serde_json::Value> {
        self.executed.lock().unwrap().push(node.name.clone());
        Ok(serde_json::json!({
            "step": node.name,
            "upstream": upstream.keys().collect::<Vec<_>>(),
        }))
    }
}

#[tokio::test]
async fn test_parallel_fan_out_graph_run() {
    let executor = Arc::new(TableExecutor {
        executed: Mutex::new(Vec::new()),
    });
    let mut runner = ParallelExecutor::new(
        WorkflowGraph::with_parallel_analysis(),
        Arc::clone(&executor) as Arc<dyn StepExecutor>,
        4,
    );

    let report = runner.run().await.unwrap();
    assert!(report.success());
    assert_eq!(report.completed, 6);

    let executed = executor.executed.lock().unwrap().clone();
    let position = |name: &str| executed.iter().position(|s| s == name).unwrap();
    // Dependencies always ran before their dependents.
    assert!(position("Planner") < position("Writer"));
    assert!(position("Writer") < position("SecurityAnalyzer"));
    assert!(position("Writer") < position("StyleChecker"));
    assert!(position("SecurityAnalyzer") < position("Reviewer"));
    assert!(position("StyleChecker") < position("Reviewer"));
    assert!(position("Reviewer") < position("Tester"));

    // Fan-in saw both analysis outputs.
    let reviewer = report.output_of("Reviewer").unwrap();
    assert_eq!(
        reviewer["upstream"],
        serde_json::json!(["SecurityAnalyzer", "StyleChecker"])
    );
}

#[tokio::test]
async fn test_cyclic_graph_never_runs() {
    let mut graph = WorkflowGraph::new();
    graph.add_node("A", vec!["B".into()], "mock");
    graph.add_node("B", vec!["A".into()], "mock");

    let executor = Arc::new(TableExecutor {
        executed: Mutex::new(Vec::new()),
    });
    let mut runner = ParallelExecutor::new(graph, Arc::clone(&executor) as Arc<dyn StepExecutor>, 2);

    assert!(matches!(
        runner.run().await.unwrap_err(),
        AgentFlowError::Config(_)
    ));
    assert!(executor.executed.lock().unwrap().is_empty());
}
