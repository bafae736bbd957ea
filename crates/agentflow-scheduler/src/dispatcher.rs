use crate::directory::AgentDirectory;
use crate::queue::TaskQueue;
use crate::task::{AgentState, Task, TaskPriority, TaskStatus};
use agentflow_core::{AgentFlowError, AgentFlowResult};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Execution capability consumed by the dispatch loop.
///
/// Implementations wrap whatever actually performs the work (an agent HTTP
/// service, a subprocess, a simulation). The dispatcher only cares about the
/// success/failure contract: `Ok(payload)` completes the task, `Err` fails it.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` on `agent` and return the result payload.
    async fn execute(&self, task: &Task, agent: &AgentState) -> AgentFlowResult<serde_json::Value>;
}

/// Tuning knobs for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often the loop polls for runnable tasks.
    pub poll_interval: Duration,
    /// Bounded wait applied to the loop join and the worker drain at stop.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Background dispatch loop matching runnable tasks to available agents.
///
/// On each tick the loop computes the runnable set, claims an agent per task
/// (in priority order), marks both sides busy, and spawns the execution on a
/// separate worker so a long task never blocks the loop. Workers report back
/// through the queue and directory; an executor error becomes a FAILED task
/// plus an ERROR agent, never a crashed loop.
pub struct Dispatcher {
    queue: Arc<RwLock<TaskQueue>>,
    directory: Arc<AgentDirectory>,
    executor: Arc<dyn TaskExecutor>,
    config: DispatcherConfig,
    stop_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    workers: Arc<Mutex<JoinSet<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher over an injected queue, directory, and executor.
    pub fn new(
        queue: Arc<RwLock<TaskQueue>>,
        directory: Arc<AgentDirectory>,
        executor: Arc<dyn TaskExecutor>,
        config: DispatcherConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            queue,
            directory,
            executor,
            config,
            stop_tx,
            loop_handle: Mutex::new(None),
            workers: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Submit a new task.
    pub async fn submit_task(
        &self,
        description: impl Into<String>,
        target_role: impl Into<String>,
        priority: TaskPriority,
        dependencies: Vec<String>,
    ) -> AgentFlowResult<Task> {
        let task = Task::new(description, target_role)
            .with_priority(priority)
            .with_dependencies(dependencies);
        let mut queue = self.queue.write().await;
        queue.submit(task.clone())?;
        Ok(task)
    }

    /// Snapshot of a task by id.
    pub async fn task_status(&self, task_id: &str) -> Option<Task> {
        self.queue.read().await.get(task_id).cloned()
    }

    /// Cancel a pending task. Returns false for unknown or already-running
    /// tasks.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        self.queue.write().await.cancel(task_id)
    }

    /// Run one dispatch round: match runnable tasks to available agents and
    /// spawn their execution. Returns the number of tasks dispatched.
    pub async fn process_queue(&self) -> AgentFlowResult<usize> {
        let runnable = self.queue.read().await.get_runnable_tasks();
        let mut dispatched = 0;

        for task in runnable {
            let Some(agent) = self.directory.claim(&task.target_role, &task.id).await? else {
                continue;
            };

            // The agent is claimed; mark the task side under the queue lock
            // before the worker can observe it.
            let task = {
                let mut queue = self.queue.write().await;
                let Some(mut current) = queue.get(&task.id).cloned() else {
                    // Task vanished between snapshot and claim; release the agent.
                    self.directory.set_idle(&agent.id, false).await?;
                    continue;
                };
                if current.status != TaskStatus::Pending {
                    self.directory.set_idle(&agent.id, false).await?;
                    continue;
                }
                current.status = TaskStatus::Running;
                current.assigned_agent_id = Some(agent.id.clone());
                current.started_at = Some(Utc::now());
                current.updated_at = current.started_at.unwrap_or_else(Utc::now);
                queue.update(current.clone());
                current
            };

            info!(task_id = %task.id, agent_id = %agent.id, "Dispatching task");
            self.spawn_worker(task, agent).await;
            dispatched += 1;
        }

        if dispatched == 0 {
            let stats = self.queue.read().await.stats();
            if stats.pending > 0 && stats.running == 0 {
                warn!(
                    pending = stats.pending,
                    "No runnable tasks and nothing in flight; pending tasks may have unmet dependencies or no matching agent"
                );
            }
        }

        Ok(dispatched)
    }

    /// Execute the task off the loop's critical path.
    async fn spawn_worker(&self, task: Task, agent: AgentState) {
        let queue = Arc::clone(&self.queue);
        let directory = Arc::clone(&self.directory);
        let executor = Arc::clone(&self.executor);

        let mut workers = self.workers.lock().await;
        // Reap any workers that already finished so the set stays small.
        while workers.try_join_next().is_some() {}

        workers.spawn(async move {
            let outcome = executor.execute(&task, &agent).await;
            let report = match outcome {
                Ok(result) => complete_task(&queue, &directory, &task.id, result).await,
                Err(e) => fail_task(&queue, &directory, &task.id, &e.to_string()).await,
            };
            if let Err(e) = report {
                error!(task_id = %task.id, error = %e, "Failed to record task outcome");
            }
        });
    }

    /// Start the background dispatch loop. Idempotent; a second call warns
    /// and returns.
    pub async fn start(&self) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            warn!("Dispatcher is already running");
            return;
        }
        // Reset any stop request left over from a previous run.
        let _ = self.stop_tx.send(false);
        let mut stop_rx = self.stop_tx.subscribe();

        let queue = Arc::clone(&self.queue);
        let directory = Arc::clone(&self.directory);
        let executor = Arc::clone(&self.executor);
        let workers = Arc::clone(&self.workers);
        let config = self.config.clone();

        let looper = Dispatcher {
            queue,
            directory,
            executor,
            config: config.clone(),
            stop_tx: self.stop_tx.clone(),
            loop_handle: Mutex::new(None),
            workers,
        };

        *handle = Some(tokio::spawn(async move {
            info!("Dispatcher loop started");
            let mut ticker = tokio::time::interval(config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = looper.process_queue().await {
                            error!(error = %e, "Dispatch round failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Dispatcher loop stopped");
        }));
        info!("Dispatcher started");
    }

    /// Stop the dispatch loop and drain in-flight workers.
    ///
    /// Idempotent. Joins the loop and then the workers, each under the
    /// configured grace period; workers still running after that are
    /// abandoned with a warning rather than waited on forever.
    pub async fn stop(&self) -> AgentFlowResult<()> {
        let _ = self.stop_tx.send(true);

        let mut loop_error = None;
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.config.shutdown_grace, handle)
                .await
                .is_err()
            {
                loop_error = Some(AgentFlowError::Scheduler(
                    "dispatch loop did not stop within the grace period".to_string(),
                ));
            }
        }

        // Workers are drained (or aborted) even when the loop join timed
        // out, so no worker outlives stop() on either path.
        let mut workers = self.workers.lock().await;
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("In-flight task workers did not finish within the grace period");
            workers.abort_all();
        }

        match loop_error {
            Some(e) => Err(e),
            None => {
                info!("Dispatcher stopped");
                Ok(())
            }
        }
    }
}

/// Record a successful execution: task COMPLETED, agent back to IDLE.
async fn complete_task(
    queue: &Arc<RwLock<TaskQueue>>,
    directory: &Arc<AgentDirectory>,
    task_id: &str,
    result: serde_json::Value,
) -> AgentFlowResult<()> {
    let agent_id = {
        let mut queue = queue.write().await;
        let Some(mut task) = queue.get(task_id).cloned() else {
            return Ok(());
        };
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.completed_at = Some(Utc::now());
        task.updated_at = task.completed_at.unwrap_or_else(Utc::now);
        let agent_id = task.assigned_agent_id.clone();
        queue.update(task);
        agent_id
    };

    if let Some(agent_id) = agent_id {
        directory.set_idle(&agent_id, true).await?;
    }
    info!(task_id, "Task completed");
    Ok(())
}

/// Record a failed execution: task FAILED, agent into ERROR.
async fn fail_task(
    queue: &Arc<RwLock<TaskQueue>>,
    directory: &Arc<AgentDirectory>,
    task_id: &str,
    error_text: &str,
) -> AgentFlowResult<()> {
    let agent_id = {
        let mut queue = queue.write().await;
        let Some(mut task) = queue.get(task_id).cloned() else {
            return Ok(());
        };
        task.status = TaskStatus::Failed;
        task.error = Some(error_text.to_string());
        task.completed_at = Some(Utc::now());
        task.updated_at = task.completed_at.unwrap_or_else(Utc::now);
        let agent_id = task.assigned_agent_id.clone();
        queue.update(task);
        agent_id
    };

    if let Some(agent_id) = agent_id {
        directory.set_error(&agent_id, error_text).await?;
    }
    error!(task_id, error = error_text, "Task failed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AgentStatus;

    struct EchoExecutor;

    #[async_trait]
    impl TaskExecutor for EchoExecutor {
        async fn execute(
            &self,
            task: &Task,
            agent: &AgentState,
        ) -> AgentFlowResult<serde_json::Value> {
            Ok(serde_json::json!({
                "task": task.id,
                "agent": agent.id,
            }))
        }
    }

    struct StuckExecutor;

    #[async_trait]
    impl TaskExecutor for StuckExecutor {
        async fn execute(
            &self,
            _task: &Task,
            _agent: &AgentState,
        ) -> AgentFlowResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::Value::Null)
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn execute(
            &self,
            _task: &Task,
            _agent: &AgentState,
        ) -> AgentFlowResult<serde_json::Value> {
            Err(AgentFlowError::Agent("boom".to_string()))
        }
    }

    async fn setup(
        executor: Arc<dyn TaskExecutor>,
    ) -> (Dispatcher, Arc<RwLock<TaskQueue>>, Arc<AgentDirectory>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(RwLock::new(TaskQueue::default()));
        let directory = Arc::new(AgentDirectory::new(dir.path().join("agents.json")));
        directory
            .register(
                AgentState::new("w1", "Writer", 8101, vec!["writer".into()], "claude").idle(),
            )
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&directory),
            executor,
            DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                shutdown_grace: Duration::from_secs(2),
            },
        );
        (dispatcher, queue, directory, dir)
    }

    async fn wait_for_terminal(dispatcher: &Dispatcher, task_id: &str) -> Task {
        for _ in 0..100 {
            if let Some(task) = dispatcher.task_status(task_id).await {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_process_queue_dispatches_and_completes() {
        let (dispatcher, _queue, directory, _dir) = setup(Arc::new(EchoExecutor)).await;
        let task = dispatcher
            .submit_task("write code", "writer", TaskPriority::Normal, vec![])
            .await
            .unwrap();

        assert_eq!(dispatcher.process_queue().await.unwrap(), 1);
        let done = wait_for_terminal(&dispatcher, &task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.assigned_agent_id.as_deref(), Some("w1"));
        assert!(done.result.is_some());

        let agent = directory.get("w1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_executor_error_fails_task_and_errors_agent() {
        let (dispatcher, _queue, directory, _dir) = setup(Arc::new(FailingExecutor)).await;
        let task = dispatcher
            .submit_task("explode", "writer", TaskPriority::Normal, vec![])
            .await
            .unwrap();

        dispatcher.process_queue().await.unwrap();
        let done = wait_for_terminal(&dispatcher, &task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("Agent error: boom"));

        let agent = directory.get("w1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Error);
        assert_eq!(agent.tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_no_agent_for_role_leaves_task_pending() {
        let (dispatcher, _queue, _directory, _dir) = setup(Arc::new(EchoExecutor)).await;
        let task = dispatcher
            .submit_task("test it", "tester", TaskPriority::Normal, vec![])
            .await
            .unwrap();

        assert_eq!(dispatcher.process_queue().await.unwrap(), 0);
        let status = dispatcher.task_status(&task.id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_dependency_gates_dispatch() {
        let (dispatcher, _queue, _directory, _dir) = setup(Arc::new(EchoExecutor)).await;
        let first = dispatcher
            .submit_task("first", "writer", TaskPriority::Normal, vec![])
            .await
            .unwrap();
        let second = dispatcher
            .submit_task(
                "second",
                "writer",
                TaskPriority::Normal,
                vec![first.id.clone()],
            )
            .await
            .unwrap();

        // Only the first task is runnable; the single writer takes it.
        assert_eq!(dispatcher.process_queue().await.unwrap(), 1);
        wait_for_terminal(&dispatcher, &first.id).await;

        assert_eq!(dispatcher.process_queue().await.unwrap(), 1);
        let done = wait_for_terminal(&dispatcher, &second.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let (dispatcher, _queue, _directory, _dir) = setup(Arc::new(EchoExecutor)).await;
        let task = dispatcher
            .submit_task("cancel me", "writer", TaskPriority::Normal, vec![])
            .await
            .unwrap();

        assert!(dispatcher.cancel_task(&task.id).await);
        assert_eq!(dispatcher.process_queue().await.unwrap(), 0);
        let status = dispatcher.task_status(&task.id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stop_aborts_stuck_workers() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(RwLock::new(TaskQueue::default()));
        let directory = Arc::new(AgentDirectory::new(dir.path().join("agents.json")));
        directory
            .register(
                AgentState::new("w1", "Writer", 8101, vec!["writer".into()], "claude").idle(),
            )
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            directory,
            Arc::new(StuckExecutor),
            DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                shutdown_grace: Duration::from_millis(100),
            },
        );
        let task = dispatcher
            .submit_task("hang forever", "writer", TaskPriority::Normal, vec![])
            .await
            .unwrap();

        dispatcher.start().await;
        // Wait until the worker is actually in flight.
        for _ in 0..100 {
            if dispatcher.task_status(&task.id).await.unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // stop() must return promptly, aborting the stuck worker rather
        // than waiting out its 60s sleep.
        let stopped = tokio::time::timeout(Duration::from_secs(5), dispatcher.stop()).await;
        assert!(stopped.is_ok());
        stopped.unwrap().unwrap();

        // The aborted worker never reported; the task record is untouched.
        let status = dispatcher.task_status(&task.id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (dispatcher, _queue, _directory, _dir) = setup(Arc::new(EchoExecutor)).await;
        dispatcher.start().await;
        dispatcher.start().await; // warns, no second loop
        dispatcher.stop().await.unwrap();
        dispatcher.stop().await.unwrap(); // no-op
    }
}
