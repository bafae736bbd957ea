use crate::task::{AgentState, AgentStatus};
use agentflow_core::AgentFlowResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Serialize, Deserialize)]
struct DirectorySnapshot {
    last_updated: DateTime<Utc>,
    agents: HashMap<String, AgentState>,
}

/// Directory of worker agents with file-based persistence.
///
/// Every mutating call rewrites the full directory snapshot to disk before
/// returning, so a reader observing saved state never sees a partial write.
/// Writes go to a temp file first and are renamed into place; a crash
/// mid-write leaves either the old or the new snapshot, never a torn one.
///
/// Mutations are a closed set of named transitions. There is deliberately no
/// generic field-patch API: the `current_task_id`/`Working` invariant is
/// maintained by construction.
pub struct AgentDirectory {
    states: RwLock<HashMap<String, AgentState>>,
    state_file: PathBuf,
}

impl AgentDirectory {
    /// Create a directory persisting to `state_file`.
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            state_file: state_file.into(),
        }
    }

    /// Restore agent states from the snapshot file.
    ///
    /// A missing file starts fresh; malformed entries are skipped with a
    /// warning rather than failing the whole load.
    pub async fn load(&self) -> AgentFlowResult<usize> {
        if !self.state_file.exists() {
            info!("No agent state file found, starting fresh");
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(&self.state_file).await?;
        let raw: serde_json::Value = serde_json::from_str(&content)?;

        let mut states = self.states.write().await;
        states.clear();
        if let Some(agents) = raw.get("agents").and_then(|a| a.as_object()) {
            for (agent_id, state_value) in agents {
                match serde_json::from_value::<AgentState>(state_value.clone()) {
                    Ok(state) => {
                        states.insert(agent_id.clone(), state);
                    }
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Skipping malformed agent state");
                    }
                }
            }
        }
        info!(count = states.len(), "Loaded agent states");
        Ok(states.len())
    }

    /// Register a new agent or replace an existing record, then persist.
    pub async fn register(&self, agent: AgentState) -> AgentFlowResult<()> {
        let mut states = self.states.write().await;
        info!(agent_id = %agent.id, roles = ?agent.roles, "Registered agent");
        states.insert(agent.id.clone(), agent);
        self.persist(&states).await
    }

    /// Get the state of one agent.
    pub async fn get(&self, agent_id: &str) -> Option<AgentState> {
        self.states.read().await.get(agent_id).cloned()
    }

    /// All IDLE agents, optionally filtered to those whose role set contains
    /// `role`. Callers must not assume a specific ordering.
    pub async fn get_available(&self, role: Option<&str>) -> Vec<AgentState> {
        let states = self.states.read().await;
        states
            .values()
            .filter(|s| s.is_available())
            .filter(|s| role.map_or(true, |r| s.can_handle_role(r)))
            .cloned()
            .collect()
    }

    /// Find the first available agent for `role` and mark it WORKING on
    /// `task_id`, all under one write lock so two dispatches cannot claim
    /// the same agent.
    pub async fn claim(&self, role: &str, task_id: &str) -> AgentFlowResult<Option<AgentState>> {
        let mut states = self.states.write().await;
        let claimed_id = states
            .values()
            .find(|s| s.is_available() && s.can_handle_role(role))
            .map(|s| s.id.clone());

        let Some(agent_id) = claimed_id else {
            return Ok(None);
        };
        if let Some(state) = states.get_mut(&agent_id) {
            state.status = AgentStatus::Working;
            state.current_task_id = Some(task_id.to_string());
            state.last_seen = Utc::now();
        }
        debug!(agent_id = %agent_id, task_id, "Agent claimed");
        let claimed = states.get(&agent_id).cloned();
        self.persist(&states).await?;
        Ok(claimed)
    }

    /// Mark an agent as working on a task.
    pub async fn set_working(&self, agent_id: &str, task_id: &str) -> AgentFlowResult<()> {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent_id) {
            state.status = AgentStatus::Working;
            state.current_task_id = Some(task_id.to_string());
            state.last_seen = Utc::now();
        }
        self.persist(&states).await
    }

    /// Mark an agent as idle. Increments the completion counter when
    /// `task_completed` is true.
    pub async fn set_idle(&self, agent_id: &str, task_completed: bool) -> AgentFlowResult<()> {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent_id) {
            if task_completed {
                state.tasks_completed += 1;
            }
            state.status = AgentStatus::Idle;
            state.current_task_id = None;
            state.error_message = None;
            state.last_seen = Utc::now();
        }
        self.persist(&states).await
    }

    /// Mark an agent as errored and record the message. Increments the
    /// failure counter.
    pub async fn set_error(&self, agent_id: &str, message: &str) -> AgentFlowResult<()> {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent_id) {
            state.tasks_failed += 1;
            state.status = AgentStatus::Error;
            state.current_task_id = None;
            state.error_message = Some(message.to_string());
            state.last_seen = Utc::now();
        }
        self.persist(&states).await
    }

    /// Snapshot of all agent states.
    pub async fn all_states(&self) -> HashMap<String, AgentState> {
        self.states.read().await.clone()
    }

    /// Counts of (working, idle, total) agents.
    pub async fn counts(&self) -> (usize, usize, usize) {
        let states = self.states.read().await;
        let working = states
            .values()
            .filter(|s| s.status == AgentStatus::Working)
            .count();
        let idle = states.values().filter(|s| s.is_available()).count();
        (working, idle, states.len())
    }

    /// Write the full snapshot to the state file, temp-then-rename.
    async fn persist(&self, states: &HashMap<String, AgentState>) -> AgentFlowResult<()> {
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let snapshot = DirectorySnapshot {
            last_updated: Utc::now(),
            agents: states.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        let tmp = self
            .state_file
            .with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.state_file).await?;

        debug!(count = states.len(), "Saved agent states");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent(id: &str, role: &str) -> AgentState {
        AgentState::new(
            id,
            format!("{role} agent"),
            8100,
            vec![role.to_string()],
            "claude",
        )
        .idle()
    }

    fn directory_in(dir: &tempfile::TempDir) -> AgentDirectory {
        AgentDirectory::new(dir.path().join("agent_status.json"))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_in(&dir);

        directory.register(sample_agent("a1", "writer")).await.unwrap();
        let state = directory.get("a1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Idle);
        assert!(dir.path().join("agent_status.json").exists());
    }

    #[tokio::test]
    async fn test_get_available_filters_by_role() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_in(&dir);
        directory.register(sample_agent("a1", "writer")).await.unwrap();
        directory.register(sample_agent("a2", "tester")).await.unwrap();

        assert_eq!(directory.get_available(None).await.len(), 2);
        let writers = directory.get_available(Some("writer")).await;
        assert_eq!(writers.len(), 1);
        assert_eq!(writers[0].id, "a1");
        assert!(directory.get_available(Some("planner")).await.is_empty());
    }

    #[tokio::test]
    async fn test_claim_marks_working() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_in(&dir);
        directory.register(sample_agent("a1", "writer")).await.unwrap();

        let claimed = directory.claim("writer", "task-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, "a1");
        assert_eq!(claimed.status, AgentStatus::Working);
        assert_eq!(claimed.current_task_id.as_deref(), Some("task-1"));

        // No second idle writer to claim.
        assert!(directory.claim("writer", "task-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_working_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_in(&dir);
        directory.register(sample_agent("a1", "writer")).await.unwrap();

        directory.set_working("a1", "task-1").await.unwrap();
        let state = directory.get("a1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Working);
        assert!(state.current_task_id.is_some());

        directory.set_idle("a1", true).await.unwrap();
        let state = directory.get("a1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Idle);
        assert!(state.current_task_id.is_none());
        assert_eq!(state.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_set_error_counts_failure() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_in(&dir);
        directory.register(sample_agent("a1", "writer")).await.unwrap();
        directory.set_working("a1", "task-1").await.unwrap();

        directory.set_error("a1", "agent crashed").await.unwrap();
        let state = directory.get("a1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Error);
        assert_eq!(state.tasks_failed, 1);
        assert_eq!(state.error_message.as_deref(), Some("agent crashed"));
        assert!(state.current_task_id.is_none());
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_status.json");

        let directory = AgentDirectory::new(&path);
        directory.register(sample_agent("a1", "writer")).await.unwrap();
        directory.set_working("a1", "task-9").await.unwrap();

        let reloaded = AgentDirectory::new(&path);
        assert_eq!(reloaded.load().await.unwrap(), 1);
        let state = reloaded.get("a1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Working);
        assert_eq!(state.current_task_id.as_deref(), Some("task-9"));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_in(&dir);
        assert_eq!(directory.load().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_skips_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_status.json");
        let doc = serde_json::json!({
            "last_updated": Utc::now(),
            "agents": {
                "good": sample_agent("good", "writer"),
                "bad": {"id": "bad"}
            }
        });
        tokio::fs::write(&path, doc.to_string()).await.unwrap();

        let directory = AgentDirectory::new(&path);
        assert_eq!(directory.load().await.unwrap(), 1);
        assert!(directory.get("good").await.is_some());
        assert!(directory.get("bad").await.is_none());
    }
}
