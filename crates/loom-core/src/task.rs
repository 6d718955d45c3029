use crate::consent::Response;
use crate::error::{LoomError, Result};
use crate::paths;
use crate::types::{ReplayMode, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

// ---------------------------------------------------------------------------
// TaskSpec / TaskGraph
// ---------------------------------------------------------------------------

/// One node of a decomposition, before it becomes a ledger task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A required task that ends FAILED abandons the ceremony; an optional
    /// one only degrades it.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            depends_on: Vec::new(),
            required: true,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Output of the decomposition collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub tasks: Vec<TaskSpec>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    /// Check ids, dependency references and acyclicity.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(LoomError::InvalidGraph("graph has no tasks".into()));
        }
        let mut seen = HashSet::new();
        for spec in &self.tasks {
            paths::validate_id(&spec.id)?;
            if !seen.insert(spec.id.as_str()) {
                return Err(LoomError::InvalidGraph(format!(
                    "duplicate task id '{}'",
                    spec.id
                )));
            }
        }
        for spec in &self.tasks {
            for dep in &spec.depends_on {
                if dep == &spec.id {
                    return Err(LoomError::InvalidGraph(format!(
                        "task '{}' depends on itself",
                        spec.id
                    )));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(LoomError::InvalidGraph(format!(
                        "task '{}' depends on unknown task '{dep}'",
                        spec.id
                    )));
                }
            }
        }
        let order = topological_order(
            self.tasks
                .iter()
                .map(|s| (s.id.as_str(), s.depends_on.as_slice())),
        );
        if order.len() != self.tasks.len() {
            return Err(LoomError::InvalidGraph("dependency cycle detected".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    pub status: TaskStatus,
    /// Worker currently bound to the task.
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    /// `output` is a checkpoint, not a final result.
    #[serde(default)]
    pub output_partial: bool,
    /// Number of invitations issued, not counting DEBUG replays.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_response: Option<Response>,
    /// Why the task last left the happy path.
    #[serde(default)]
    pub reason: Option<String>,
    /// Replay mode the next offer runs under.
    #[serde(default)]
    pub replay: Option<ReplayMode>,
    /// FAILED and settled: no further retries.
    #[serde(default)]
    pub exhausted: bool,
}

impl Task {
    pub fn from_spec(spec: &TaskSpec) -> Self {
        Self {
            id: spec.id.clone(),
            description: spec.description.clone(),
            depends_on: spec.depends_on.clone(),
            required: spec.required,
            status: TaskStatus::Pending,
            assignee: None,
            output: None,
            output_partial: false,
            attempts: 0,
            heartbeat: None,
            last_response: None,
            reason: None,
            replay: None,
            exhausted: false,
        }
    }

    /// COMPLETE, or FAILED with no retries left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Complete => true,
            TaskStatus::Failed => self.exhausted,
            _ => false,
        }
    }

    pub fn is_held_by(&self, worker: &str) -> bool {
        self.assignee.as_deref() == Some(worker)
    }
}

// ---------------------------------------------------------------------------
// Task table queries (operate on a &[Task])
// ---------------------------------------------------------------------------

pub fn find<'a>(tasks: &'a [Task], id: &str) -> Result<&'a Task> {
    tasks
        .iter()
        .find(|t| t.id == id)
        .ok_or_else(|| LoomError::TaskNotFound(id.to_string()))
}

pub fn find_mut<'a>(tasks: &'a mut [Task], id: &str) -> Result<&'a mut Task> {
    tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| LoomError::TaskNotFound(id.to_string()))
}

/// True when every dependency of `task` is COMPLETE.
pub fn dependencies_complete(tasks: &[Task], task: &Task) -> bool {
    task.depends_on.iter().all(|dep| {
        tasks
            .iter()
            .any(|t| &t.id == dep && t.status == TaskStatus::Complete)
    })
}

/// PENDING tasks whose dependencies are all COMPLETE, in table order.
pub fn ready_tasks(tasks: &[Task]) -> Vec<&Task> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending && dependencies_complete(tasks, t))
        .collect()
}

/// Tasks that list `id` as a direct dependency.
pub fn direct_dependents<'a>(tasks: &'a [Task], id: &str) -> Vec<&'a Task> {
    tasks
        .iter()
        .filter(|t| t.depends_on.iter().any(|d| d == id))
        .collect()
}

/// Every task downstream of `id`, breadth-first, without `id` itself.
pub fn transitive_dependents(tasks: &[Task], id: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut queue = VecDeque::from([id.to_string()]);
    while let Some(current) = queue.pop_front() {
        for dep in direct_dependents(tasks, &current) {
            if dep.id != id && !out.contains(&dep.id) {
                out.push(dep.id.clone());
                queue.push_back(dep.id.clone());
            }
        }
    }
    out
}

/// Kahn's algorithm, stable with respect to input order. Nodes on a cycle
/// are left out, so a short result means the graph is cyclic.
pub fn topological_order<'a, I>(nodes: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let nodes: Vec<(&str, &[String])> = nodes.into_iter().collect();
    let mut indegree: HashMap<&str, usize> = nodes
        .iter()
        .map(|(id, deps)| (*id, deps.len()))
        .collect();
    let mut done: Vec<String> = Vec::with_capacity(nodes.len());
    let mut progressed = true;
    while progressed {
        progressed = false;
        for (id, _) in &nodes {
            if indegree.get(id) != Some(&0) || done.iter().any(|d| d == id) {
                continue;
            }
            done.push(id.to_string());
            progressed = true;
            for (other, other_deps) in &nodes {
                let hits = other_deps.iter().filter(|d| d.as_str() == *id).count();
                if let Some(n) = indegree.get_mut(other) {
                    *n = n.saturating_sub(hits);
                }
            }
        }
    }
    done
}

/// Task table in dependency order.
pub fn dependency_order(tasks: &[Task]) -> Vec<&Task> {
    let order = topological_order(
        tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.as_slice())),
    );
    order
        .iter()
        .filter_map(|id| tasks.iter().find(|t| &t.id == id))
        .collect()
}

/// Human-readable summary: "2/5 complete, 1 in flight, 1 failed"
pub fn summarize(tasks: &[Task]) -> String {
    let total = tasks.len();
    let done = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Complete)
        .count();
    let in_flight = tasks.iter().filter(|t| t.status.is_in_flight()).count();
    let failed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .count();
    format!("{done}/{total} complete, {in_flight} in flight, {failed} failed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
