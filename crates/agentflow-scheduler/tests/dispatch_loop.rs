//! End-to-end dispatch loop test.
//!
//! Runs the background dispatcher against a mock executor and a small agent
//! pool, and verifies dependency ordering, priority selection, failure
//! bookkeeping, and clean shutdown.

use agentflow_core::{AgentFlowError, AgentFlowResult};
use agentflow_scheduler::{
    AgentDirectory, AgentState, AgentStatus, Dispatcher, DispatcherConfig, Task, TaskExecutor,
    TaskPriority, TaskQueue, TaskStatus,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Records the order tasks were executed in; fails tasks whose description
/// starts with "fail".
struct RecordingExecutor {
    order: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, task: &Task, agent: &AgentState) -> AgentFlowResult<serde_json::Value> {
        self.order.lock().await.push(task.description.clone());
        if task.description.starts_with("fail") {
            return Err(AgentFlowError::Agent("simulated crash".to_string()));
        }
        Ok(serde_json::json!({
            "message": format!("executed by {}", agent.id),
        }))
    }
}

struct Harness {
    dispatcher: Dispatcher,
    directory: Arc<AgentDirectory>,
    executor: Arc<RecordingExecutor>,
    _dir: tempfile::TempDir,
}

async fn harness(agents: &[(&str, &str)]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(RwLock::new(TaskQueue::new(100)));
    let directory = Arc::new(AgentDirectory::new(dir.path().join("agents.json")));
    for (id, role) in agents {
        directory
            .register(AgentState::new(*id, *id, 8100, vec![role.to_string()], "mock").idle())
            .await
            .unwrap();
    }
    let executor = Arc::new(RecordingExecutor {
        order: Mutex::new(Vec::new()),
    });
    let dispatcher = Dispatcher::new(
        queue,
        Arc::clone(&directory),
        executor.clone(),
        DispatcherConfig {
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
        },
    );
    Harness {
        dispatcher,
        directory,
        executor,
        _dir: dir,
    }
}

async fn await_status(dispatcher: &Dispatcher, task_id: &str, status: TaskStatus) {
    for _ in 0..200 {
        if let Some(task) = dispatcher.task_status(task_id).await {
            if task.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {status:?}");
}

#[tokio::test]
async fn test_chain_executes_in_dependency_order() {
    let h = harness(&[("planner-1", "planner"), ("writer-1", "writer")]).await;

    let plan = h
        .dispatcher
        .submit_task("plan", "planner", TaskPriority::Normal, vec![])
        .await
        .unwrap();
    let write = h
        .dispatcher
        .submit_task("write", "writer", TaskPriority::Normal, vec![plan.id.clone()])
        .await
        .unwrap();

    h.dispatcher.start().await;
    await_status(&h.dispatcher, &write.id, TaskStatus::Completed).await;
    h.dispatcher.stop().await.unwrap();

    let order = h.executor.order.lock().await.clone();
    assert_eq!(order, vec!["plan".to_string(), "write".to_string()]);

    let (working, idle, total) = h.directory.counts().await;
    assert_eq!(working, 0);
    assert_eq!(idle, 2);
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_high_priority_dispatched_first() {
    // One writer: tasks must be taken one at a time, in priority order.
    let h = harness(&[("writer-1", "writer")]).await;

    let low = h
        .dispatcher
        .submit_task("low", "writer", TaskPriority::Low, vec![])
        .await
        .unwrap();
    let high = h
        .dispatcher
        .submit_task("high", "writer", TaskPriority::High, vec![])
        .await
        .unwrap();

    h.dispatcher.start().await;
    await_status(&h.dispatcher, &high.id, TaskStatus::Completed).await;
    await_status(&h.dispatcher, &low.id, TaskStatus::Completed).await;
    h.dispatcher.stop().await.unwrap();

    let order = h.executor.order.lock().await.clone();
    assert_eq!(order, vec!["high".to_string(), "low".to_string()]);
}

#[tokio::test]
async fn test_failure_marks_task_and_agent() {
    let h = harness(&[("tester-1", "tester")]).await;

    let task = h
        .dispatcher
        .submit_task("fail this one", "tester", TaskPriority::Normal, vec![])
        .await
        .unwrap();

    h.dispatcher.start().await;
    await_status(&h.dispatcher, &task.id, TaskStatus::Failed).await;
    h.dispatcher.stop().await.unwrap();

    let task = h.dispatcher.task_status(&task.id).await.unwrap();
    assert!(task.error.as_deref().unwrap_or_default().contains("simulated crash"));

    let agent = h.directory.get("tester-1").await.unwrap();
    assert_eq!(agent.status, AgentStatus::Error);
    assert_eq!(agent.tasks_failed, 1);
}

#[tokio::test]
async fn test_task_with_unmatched_role_stays_pending() {
    let h = harness(&[("writer-1", "writer")]).await;

    let task = h
        .dispatcher
        .submit_task("analyze", "analyzer", TaskPriority::Normal, vec![])
        .await
        .unwrap();

    h.dispatcher.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.dispatcher.stop().await.unwrap();

    let task = h.dispatcher.task_status(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_work() {
    let h = harness(&[("writer-1", "writer")]).await;
    let task = h
        .dispatcher
        .submit_task("write", "writer", TaskPriority::Normal, vec![])
        .await
        .unwrap();

    h.dispatcher.start().await;
    // Give the loop one tick to dispatch, then stop immediately.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.dispatcher.stop().await.unwrap();

    // After stop returns, the worker must have reported its outcome.
    let task = h.dispatcher.task_status(&task.id).await.unwrap();
    assert!(task.status.is_terminal());
}
