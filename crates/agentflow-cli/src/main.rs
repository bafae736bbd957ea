use agentflow_core::AgentFlowResult;
use agentflow_scheduler::{
    AgentDirectory, AgentState, Dispatcher, DispatcherConfig, Task, TaskExecutor, TaskPriority,
    TaskQueue,
};
use agentflow_workflow::{
    EngineConfig, GraphNode, ParallelExecutor, SimulatedRunner, StepExecutor, StepName, StepResult,
    WorkflowEngine, WorkflowGraph, WorkflowObserver, WorkflowState, WorkflowStatus,
    WorkflowSummary,
};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentflow", about = "AgentFlow — multi-agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start and execute a workflow for a task description
    Run {
        /// What the workflow should accomplish
        description: String,
        /// Reuse a fixed task id instead of generating one
        #[arg(long)]
        task_id: Option<String>,
        /// Run the fan-out analysis graph instead of the sequential chain
        #[arg(long)]
        parallel: bool,
    },
    /// Show the status of one workflow
    Status {
        /// Workflow task id
        task_id: String,
    },
    /// List known workflows, newest first
    List {
        /// Only show workflows with this status (e.g. COMPLETED, IN_DLQ)
        #[arg(long)]
        status: Option<String>,
    },
    /// Run a scripted dispatch demo against a local agent pool
    Demo,
    /// Show the persisted agent directory
    Agents,
}

#[derive(Deserialize, Default)]
struct AgentFlowConfig {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    parallel: ParallelConfig,
}

#[derive(Deserialize)]
struct SchedulerConfig {
    #[serde(default = "default_max_queue_size")]
    max_queue_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_agent_state_file")]
    agent_state_file: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            poll_interval_secs: default_poll_interval_secs(),
            agent_state_file: default_agent_state_file(),
        }
    }
}

#[derive(Deserialize)]
struct ParallelConfig {
    #[serde(default = "default_max_concurrent")]
    max_concurrent: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_queue_size() -> usize {
    100
}
fn default_poll_interval_secs() -> u64 {
    2
}
fn default_agent_state_file() -> PathBuf {
    PathBuf::from("agent_status.json")
}
fn default_max_concurrent() -> usize {
    4
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        let content = tokio::fs::read_to_string(&cli.config).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", cli.config.display(), e)
        })?;
        toml::from_str(&content)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        AgentFlowConfig::default()
    };

    match cli.command {
        Commands::Run {
            description,
            task_id,
            parallel,
        } => {
            if parallel {
                run_parallel(&config, &description).await?;
            } else {
                run_sequential(&config, task_id, &description).await?;
            }
        }
        Commands::Status { task_id } => {
            let engine = WorkflowEngine::new(config.engine, Arc::new(SimulatedRunner));
            match engine.status(&task_id).await? {
                Some(summary) => print_summary(&summary),
                None => println!("No workflow found with id '{task_id}'"),
            }
        }
        Commands::List { status } => {
            let filter = status.map(|s| parse_status(&s)).transpose()?;
            let engine = WorkflowEngine::new(config.engine, Arc::new(SimulatedRunner));
            let summaries = engine.list(filter).await?;
            if summaries.is_empty() {
                println!("No workflows found");
            } else {
                print_workflow_table(&summaries);
            }
        }
        Commands::Demo => run_demo(&config).await?,
        Commands::Agents => {
            let directory = AgentDirectory::new(config.scheduler.agent_state_file.clone());
            directory.load().await?;
            print_agent_table(&sorted_agents(&directory).await);
        }
    }

    Ok(())
}

/// Prints step progress as the engine works through the chain.
struct ConsoleObserver;

#[async_trait]
impl WorkflowObserver for ConsoleObserver {
    async fn step_started(&self, _task_id: &str, step: StepName) {
        println!("  -> running {step}");
    }

    async fn step_ended(&self, _task_id: &str, result: &StepResult) {
        println!("     {:?}", result.outcome);
    }

    async fn workflow_ended(&self, state: &WorkflowState) {
        println!("Workflow {} finished: {:?}", state.task_id, state.status);
    }
}

async fn run_sequential(
    config: &AgentFlowConfig,
    task_id: Option<String>,
    description: &str,
) -> anyhow::Result<()> {
    let engine = WorkflowEngine::new(config.engine.clone(), Arc::new(SimulatedRunner));
    let state = engine.start(task_id, description).await?;
    println!("Started workflow {} ({})", state.task_id, description);

    let done = engine.execute_observed(&state.task_id, &ConsoleObserver).await?;
    println!(
        "{} steps succeeded, retry_count {}, rework_count {}",
        done.steps_completed(),
        done.retry_count,
        done.rework_count
    );
    Ok(())
}

/// Graph step executor that fabricates a payload per step, mirroring what
/// the simulated chain runner does.
struct SimulatedGraphExecutor;

#[async_trait]
impl StepExecutor for SimulatedGraphExecutor {
    async fn execute(
        &self,
        node: &GraphNode,
        upstream: &BTreeMap<String, serde_json::Value>,
    ) -> AgentFlowResult<serde_json::Value> {
        Ok(serde_json::json!({
            "step": node.name,
            "agent": node.agent,
            "upstream": upstream.keys().collect::<Vec<_>>(),
            "simulated": true,
        }))
    }
}

async fn run_parallel(config: &AgentFlowConfig, description: &str) -> anyhow::Result<()> {
    println!("Running fan-out analysis graph for: {description}");
    let mut executor = ParallelExecutor::new(
        WorkflowGraph::with_parallel_analysis(),
        Arc::new(SimulatedGraphExecutor),
        config.parallel.max_concurrent,
    );
    let report = executor.run().await?;

    for record in &report.results {
        println!("  {:<18} {:?}", record.step, record.status);
    }
    println!(
        "{} completed, {} failed, {} skipped",
        report.completed, report.failed, report.skipped
    );
    Ok(())
}

/// Executor for the dispatch demo: every task succeeds with a canned result.
struct DemoExecutor;

#[async_trait]
impl TaskExecutor for DemoExecutor {
    async fn execute(&self, task: &Task, agent: &AgentState) -> AgentFlowResult<serde_json::Value> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(serde_json::json!({
            "message": format!("'{}' handled by {}", task.description, agent.id),
        }))
    }
}

async fn run_demo(config: &AgentFlowConfig) -> anyhow::Result<()> {
    let queue = Arc::new(RwLock::new(TaskQueue::new(config.scheduler.max_queue_size)));
    let directory = Arc::new(AgentDirectory::new(
        config.scheduler.agent_state_file.clone(),
    ));

    for (i, role) in ["planner", "writer", "reviewer", "tester", "analyzer"]
        .iter()
        .enumerate()
    {
        let id = format!("{role}-1");
        let port = 8100 + i as u16;
        directory
            .register(AgentState::new(&id, &id, port, vec![role.to_string()], "demo").idle())
            .await?;
    }

    let dispatcher = Dispatcher::new(
        queue,
        Arc::clone(&directory),
        Arc::new(DemoExecutor),
        DispatcherConfig {
            poll_interval: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
        },
    );

    let plan = dispatcher
        .submit_task("plan the feature", "planner", TaskPriority::High, vec![])
        .await?;
    let write = dispatcher
        .submit_task(
            "implement the feature",
            "writer",
            TaskPriority::Normal,
            vec![plan.id.clone()],
        )
        .await?;
    let review = dispatcher
        .submit_task(
            "review the implementation",
            "reviewer",
            TaskPriority::Normal,
            vec![write.id.clone()],
        )
        .await?;
    println!("Submitted 3 tasks: {} -> {} -> {}", plan.id, write.id, review.id);

    dispatcher.start().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let done = match dispatcher.task_status(&review.id).await {
            Some(task) => task.status.is_terminal(),
            None => true,
        };
        if done || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    dispatcher.stop().await?;

    for id in [&plan.id, &write.id, &review.id] {
        if let Some(task) = dispatcher.task_status(id).await {
            println!(
                "  {:<14} {:<10} {:?} {}",
                task.id,
                task.target_role,
                task.status,
                task.assigned_agent_id.as_deref().unwrap_or("-")
            );
        }
    }
    print_agent_table(&sorted_agents(&directory).await);
    Ok(())
}

async fn sorted_agents(directory: &AgentDirectory) -> Vec<AgentState> {
    let mut agents: Vec<AgentState> = directory.all_states().await.into_values().collect();
    agents.sort_by(|a, b| a.id.cmp(&b.id));
    agents
}

fn parse_status(s: &str) -> anyhow::Result<WorkflowStatus> {
    let normalized = s.trim().to_uppercase();
    serde_json::from_value(serde_json::Value::String(normalized))
        .map_err(|_| anyhow::anyhow!("unknown workflow status: '{s}'"))
}

fn print_summary(summary: &WorkflowSummary) {
    println!("Workflow:    {}", summary.task_id);
    println!("Description: {}", summary.task_description);
    println!("Status:      {:?}", summary.status);
    match summary.current_step {
        Some(step) => println!("Step:        {step}"),
        None => println!("Step:        -"),
    }
    println!(
        "Progress:    {}/{} steps, {} retries, {} reworks",
        summary.steps_completed, summary.total_steps, summary.retry_count, summary.rework_count
    );
    if !summary.history.is_empty() {
        println!("History:");
        for entry in &summary.history {
            println!(
                "  {:<10} {:<10} {}",
                entry.step.to_string(),
                format!("{:?}", entry.outcome),
                entry.completed_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
}

fn print_workflow_table(summaries: &[WorkflowSummary]) {
    println!(
        "{:<16} {:<16} {:<8} {:<22} {}",
        "TASK", "STATUS", "STEPS", "UPDATED", "DESCRIPTION"
    );
    for summary in summaries {
        let mut description: String = summary.task_description.chars().take(40).collect();
        if description.len() < summary.task_description.len() {
            description.push_str("...");
        }
        println!(
            "{:<16} {:<16} {:<8} {:<22} {}",
            summary.task_id,
            format!("{:?}", summary.status),
            format!("{}/{}", summary.steps_completed, summary.total_steps),
            summary.last_updated.format("%Y-%m-%d %H:%M:%S").to_string(),
            description
        );
    }
}

fn print_agent_table(agents: &[AgentState]) {
    if agents.is_empty() {
        println!("No agents registered");
        return;
    }
    println!(
        "{:<14} {:<10} {:<24} {:<6} {:<6} {}",
        "AGENT", "STATUS", "ROLES", "DONE", "FAILED", "TASK"
    );
    for agent in agents {
        println!(
            "{:<14} {:<10} {:<24} {:<6} {:<6} {}",
            agent.id,
            format!("{:?}", agent.status),
            agent.roles.join(","),
            agent.tasks_completed,
            agent.tasks_failed,
            agent.current_task_id.as_deref().unwrap_or("-")
        );
    }
}
