use crate::graph::{GraphNode, NodeStatus, WorkflowGraph};
use agentflow_core::{AgentFlowError, AgentFlowResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Executes one step of a graph-shaped workflow.
///
/// Implementations receive the node being run plus the outputs of every
/// upstream step that already completed.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one step and return its output payload.
    async fn execute(
        &self,
        node: &GraphNode,
        upstream_outputs: &BTreeMap<String, serde_json::Value>,
    ) -> AgentFlowResult<serde_json::Value>;
}

/// Record of one step run by the parallel executor.
#[derive(Debug, Clone, Serialize)]
pub struct StepRunRecord {
    /// Step name.
    pub step: String,
    /// Final node status (completed, failed, or skipped).
    pub status: NodeStatus,
    /// Output payload on success.
    pub output: Option<serde_json::Value>,
    /// Error text on failure.
    pub error: Option<String>,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub completed_at: DateTime<Utc>,
}

/// Summary of a whole graph run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Per-step records, in completion order within each group.
    pub results: Vec<StepRunRecord>,
    /// Steps that completed successfully.
    pub completed: usize,
    /// Steps that failed.
    pub failed: usize,
    /// Steps skipped because an earlier step failed.
    pub skipped: usize,
}

impl ExecutionReport {
    /// Whether every step completed.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Output payload of a completed step.
    pub fn output_of(&self, step: &str) -> Option<&serde_json::Value> {
        self.results
            .iter()
            .find(|r| r.step == step && r.status == NodeStatus::Completed)
            .and_then(|r| r.output.as_ref())
    }
}

/// Runs a workflow graph group by group, with bounded concurrency inside
/// each group.
///
/// Groups come from [`WorkflowGraph::get_parallel_groups`]: every member of
/// a group has all its dependencies satisfied by earlier groups, so members
/// can run simultaneously. A failure anywhere stops the run; later groups
/// are marked skipped rather than executed against missing inputs.
pub struct ParallelExecutor {
    graph: WorkflowGraph,
    executor: Arc<dyn StepExecutor>,
    max_concurrent: usize,
}

impl ParallelExecutor {
    /// Create an executor over `graph` with at most `max_concurrent` steps
    /// in flight at once. A limit of zero is treated as one.
    pub fn new(graph: WorkflowGraph, executor: Arc<dyn StepExecutor>, max_concurrent: usize) -> Self {
        Self {
            graph,
            executor,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Completed step count and total step count.
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .graph
            .nodes()
            .filter(|n| n.status == NodeStatus::Completed)
            .count();
        (done, self.graph.len())
    }

    /// Run the whole graph. Fails fast only on a malformed graph; step
    /// failures are captured in the report.
    pub async fn run(&mut self) -> AgentFlowResult<ExecutionReport> {
        let groups = self.graph.get_parallel_groups()?;
        info!(
            steps = self.graph.len(),
            groups = groups.len(),
            max_concurrent = self.max_concurrent,
            "Starting graph execution"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut outputs: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut results = Vec::new();
        let mut failed = false;

        for (index, group) in groups.iter().enumerate() {
            if failed {
                for step in group {
                    self.graph.mark_skipped(step);
                    let now = Utc::now();
                    results.push(StepRunRecord {
                        step: step.clone(),
                        status: NodeStatus::Skipped,
                        output: None,
                        error: None,
                        started_at: now,
                        completed_at: now,
                    });
                }
                continue;
            }

            debug!(group = index, steps = ?group, "Executing group");
            let mut set: JoinSet<StepRunRecord> = JoinSet::new();

            for step in group {
                let Some(node) = self.graph.get_node(step).cloned() else {
                    continue;
                };
                self.graph.mark_running(step);

                let upstream: BTreeMap<String, serde_json::Value> = node
                    .dependencies
                    .iter()
                    .filter_map(|d| outputs.get(d).map(|v| (d.clone(), v.clone())))
                    .collect();
                let executor = Arc::clone(&self.executor);
                let semaphore = Arc::clone(&semaphore);

                set.spawn(async move {
                    let started_at = Utc::now();
                    // Closed only when the set is dropped, which cannot
                    // happen while this task runs.
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return StepRunRecord {
                                step: node.name.clone(),
                                status: NodeStatus::Failed,
                                output: None,
                                error: Some("executor shut down".to_string()),
                                started_at,
                                completed_at: Utc::now(),
                            }
                        }
                    };

                    match executor.execute(&node, &upstream).await {
                        Ok(output) => StepRunRecord {
                            step: node.name.clone(),
                            status: NodeStatus::Completed,
                            output: Some(output),
                            error: None,
                            started_at,
                            completed_at: Utc::now(),
                        },
                        Err(e) => StepRunRecord {
                            step: node.name.clone(),
                            status: NodeStatus::Failed,
                            output: None,
                            error: Some(e.to_string()),
                            started_at,
                            completed_at: Utc::now(),
                        },
                    }
                });
            }

            while let Some(joined) = set.join_next().await {
                let record = joined.map_err(|e| {
                    AgentFlowError::Workflow(format!("step task panicked: {e}"))
                })?;

                match record.status {
                    NodeStatus::Completed => {
                        self.graph.mark_completed(&record.step);
                        if let Some(output) = &record.output {
                            outputs.insert(record.step.clone(), output.clone());
                        }
                        debug!(step = %record.step, "Step completed");
                    }
                    _ => {
                        self.graph.mark_failed(&record.step);
                        failed = true;
                        error!(
                            step = %record.step,
                            error = record.error.as_deref().unwrap_or("unknown"),
                            "Step failed"
                        );
                    }
                }
                results.push(record);
            }
        }

        let completed = results.iter().filter(|r| r.status == NodeStatus::Completed).count();
        let failed_count = results.iter().filter(|r| r.status == NodeStatus::Failed).count();
        let skipped = results.iter().filter(|r| r.status == NodeStatus::Skipped).count();

        if failed_count > 0 {
            warn!(completed, failed = failed_count, skipped, "Graph execution finished with failures");
        } else {
            info!(completed, "Graph execution finished");
        }

        Ok(ExecutionReport {
            results,
            completed,
            failed: failed_count,
            skipped,
        })
    }
}
