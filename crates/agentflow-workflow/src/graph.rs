use agentflow_core::{AgentFlowError, AgentFlowResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Status of a node in the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Never started because an earlier step failed.
    Skipped,
}

/// A node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    /// Step name, unique within the graph.
    pub name: String,
    /// Names of steps this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Execution status.
    #[serde(default = "default_status")]
    pub status: NodeStatus,
    /// Capability hint: which agent executes this step.
    #[serde(default)]
    pub agent: String,
}

fn default_status() -> NodeStatus {
    NodeStatus::Pending
}

/// Declarative step configuration, deserializable from JSON or TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    /// Map of step name to its declaration.
    pub steps: BTreeMap<String, StepConfig>,
}

/// One step's declaration inside a [`GraphConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    /// Names of steps this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Capability hint: which agent executes this step.
    #[serde(default)]
    pub agent: String,
}

/// Directed acyclic graph of workflow steps.
///
/// Uses ordered maps and sets throughout, so ready-sets, topological order,
/// and parallel groups are deterministic (lexicographic within a frontier)
/// regardless of insertion order.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    nodes: BTreeMap<String, GraphNode>,
    /// node -> dependents
    adjacency: BTreeMap<String, BTreeSet<String>>,
    /// node -> dependencies
    reverse_adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl WorkflowGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a declarative configuration.
    pub fn from_config(config: &GraphConfig) -> Self {
        let mut graph = Self::new();
        for (name, step) in &config.steps {
            graph.add_node(name, step.dependencies.clone(), &step.agent);
        }
        graph
    }

    /// Add a node with the given dependencies and agent hint.
    pub fn add_node(&mut self, name: &str, dependencies: Vec<String>, agent: &str) {
        self.nodes.insert(
            name.to_string(),
            GraphNode {
                name: name.to_string(),
                dependencies: dependencies.clone(),
                status: NodeStatus::Pending,
                agent: agent.to_string(),
            },
        );
        self.adjacency.entry(name.to_string()).or_default();
        let reverse = self.reverse_adjacency.entry(name.to_string()).or_default();
        for dep in &dependencies {
            reverse.insert(dep.clone());
        }
        for dep in dependencies {
            self.adjacency.entry(dep.clone()).or_default().insert(name.to_string());
            self.reverse_adjacency.entry(dep).or_default();
        }
    }

    /// Get a node by name.
    pub fn get_node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    /// All nodes, in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    /// Steps with no dependencies (entry points).
    pub fn initial_steps(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.is_empty())
            .map(|n| n.name.clone())
            .collect()
    }

    /// Pending steps whose dependencies are all in `completed`.
    pub fn get_ready_steps(&self, completed: &BTreeSet<String>) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Pending)
            .filter(|n| n.dependencies.iter().all(|d| completed.contains(d)))
            .map(|n| n.name.clone())
            .collect()
    }

    /// Steps that depend on `name`.
    pub fn downstream(&self, name: &str) -> Vec<String> {
        self.adjacency
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Steps that `name` depends on.
    pub fn upstream(&self, name: &str) -> Vec<String> {
        self.reverse_adjacency
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail when any node names a dependency that was never added.
    fn check_dependencies_known(&self) -> AgentFlowResult<()> {
        for node in self.nodes.values() {
            if let Some(dep) = node
                .dependencies
                .iter()
                .find(|d| !self.nodes.contains_key(*d))
            {
                return Err(AgentFlowError::Config(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    node.name
                )));
            }
        }
        Ok(())
    }

    /// All step names in topological order (Kahn's algorithm).
    ///
    /// Fails with a configuration error on an unknown dependency or a cycle.
    pub fn topological_sort(&self) -> AgentFlowResult<Vec<String>> {
        self.check_dependencies_known()?;
        let mut in_degree: BTreeMap<&str, usize> = self
            .reverse_adjacency
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&name, _)| name)
            .collect();
        let mut result = Vec::new();

        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());
            if let Some(dependents) = self.adjacency.get(node) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            return Err(AgentFlowError::Config(
                "workflow graph contains a cycle".to_string(),
            ));
        }
        Ok(result)
    }

    /// Whether the graph contains a cycle.
    pub fn has_cycle(&self) -> bool {
        self.topological_sort().is_err()
    }

    /// Mark a step as running.
    pub fn mark_running(&mut self, name: &str) {
        self.set_status(name, NodeStatus::Running);
    }

    /// Mark a step as completed.
    pub fn mark_completed(&mut self, name: &str) {
        self.set_status(name, NodeStatus::Completed);
    }

    /// Mark a step as failed.
    pub fn mark_failed(&mut self, name: &str) {
        self.set_status(name, NodeStatus::Failed);
    }

    /// Mark a step as skipped.
    pub fn mark_skipped(&mut self, name: &str) {
        self.set_status(name, NodeStatus::Skipped);
    }

    fn set_status(&mut self, name: &str, status: NodeStatus) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.status = status;
        }
    }

    /// Steps grouped by parallelization potential: all members of one group
    /// have no ordering relation between them and may run simultaneously.
    ///
    /// Peels the ready frontier repeatedly; if no progress is possible while
    /// nodes remain, the graph is cyclic and this fails instead of looping.
    pub fn get_parallel_groups(&self) -> AgentFlowResult<Vec<Vec<String>>> {
        self.check_dependencies_known()?;
        let mut groups = Vec::new();
        let mut completed: BTreeSet<String> = BTreeSet::new();
        let mut remaining: BTreeSet<String> = self.nodes.keys().cloned().collect();

        while !remaining.is_empty() {
            let group: Vec<String> = remaining
                .iter()
                .filter(|name| {
                    self.nodes[*name]
                        .dependencies
                        .iter()
                        .all(|d| completed.contains(d))
                })
                .cloned()
                .collect();

            if group.is_empty() {
                return Err(AgentFlowError::Config(
                    "cannot compute parallel groups: workflow graph contains a cycle".to_string(),
                ));
            }

            for name in &group {
                completed.insert(name.clone());
                remaining.remove(name);
            }
            groups.push(group);
        }

        Ok(groups)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the graph contains a node named `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// The default sequential 5-step chain.
    pub fn default_sequential() -> Self {
        let mut graph = Self::new();
        graph.add_node("Planner", vec![], "gemini");
        graph.add_node("Writer", vec!["Planner".into()], "claude");
        graph.add_node("Reviewer", vec!["Writer".into()], "claude");
        graph.add_node("Tester", vec!["Reviewer".into()], "codex");
        graph.add_node("Analyzer", vec!["Tester".into()], "gemini");
        graph
    }

    /// A fan-out/fan-in shape: SecurityAnalyzer and StyleChecker run in
    /// parallel after Writer and both gate Reviewer.
    pub fn with_parallel_analysis() -> Self {
        let mut graph = Self::new();
        graph.add_node("Planner", vec![], "gemini");
        graph.add_node("Writer", vec!["Planner".into()], "claude");
        graph.add_node("SecurityAnalyzer", vec!["Writer".into()], "gemini");
        graph.add_node("StyleChecker", vec!["Writer".into()], "claude");
        graph.add_node(
            "Reviewer",
            vec!["SecurityAnalyzer".into(), "StyleChecker".into()],
            "claude",
        );
        graph.add_node("Tester", vec!["Reviewer".into()], "codex");
        graph
    }
}
