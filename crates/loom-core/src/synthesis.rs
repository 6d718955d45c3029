//! Combining task outputs into the ceremony's final artifact, and the status
//! report that lists every task that did not complete.

use crate::ledger::Ledger;
use crate::task::{self, Task};
use crate::types::{CeremonyStatus, TaskStatus};
use serde::{Deserialize, Serialize};

/// A task that did not reach COMPLETE, with its last known state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub required: bool,
    pub reason: String,
}

impl TaskFailure {
    fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            attempts: task.attempts,
            required: task.required,
            reason: task
                .reason
                .clone()
                .unwrap_or_else(|| "no reason recorded".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub task_id: String,
    pub description: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub ceremony_id: String,
    pub master_task: String,
    pub status: CeremonyStatus,
    /// COMPLETE task outputs in dependency order.
    pub sections: Vec<Section>,
    /// Every non-COMPLETE task.
    pub gaps: Vec<TaskFailure>,
}

impl Synthesis {
    pub fn from_ledger(ledger: &Ledger) -> Self {
        let mut sections = Vec::new();
        let mut gaps = Vec::new();
        for t in task::dependency_order(&ledger.tasks) {
            match (&t.status, &t.output) {
                (TaskStatus::Complete, Some(output)) => sections.push(Section {
                    task_id: t.id.clone(),
                    description: t.description.clone(),
                    output: output.clone(),
                }),
                _ => gaps.push(TaskFailure::from_task(t)),
            }
        }
        Self {
            ceremony_id: ledger.ceremony.id.clone(),
            master_task: ledger.ceremony.master_task.clone(),
            status: ledger.ceremony.status,
            sections,
            gaps,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.gaps.is_empty()
    }

    /// Plain-text artifact: one section per task, then the gaps.
    pub fn render(&self) -> String {
        let mut out = format!("# {}\n", self.master_task);
        for s in &self.sections {
            out.push_str(&format!(
                "\n## {}: {}\n\n{}\n",
                s.task_id,
                s.description,
                s.output.trim_end()
            ));
        }
        if !self.gaps.is_empty() {
            out.push_str("\n## Gaps\n\n");
            for g in &self.gaps {
                out.push_str(&format!(
                    "- {} [{}] after {} attempt(s): {}\n",
                    g.task_id, g.status, g.attempts, g.reason
                ));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// CeremonyReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CeremonyReport {
    pub ceremony_id: String,
    pub master_task: String,
    pub status: CeremonyStatus,
    pub revision: u64,
    pub retries_used: u32,
    pub retry_budget: u32,
    #[serde(default)]
    pub reason: Option<String>,
    pub summary: String,
    pub tasks: Vec<Task>,
    /// Every non-COMPLETE task with its last known state and reason.
    pub outstanding: Vec<TaskFailure>,
}

impl CeremonyReport {
    pub fn from_ledger(ledger: &Ledger) -> Self {
        let c = &ledger.ceremony;
        Self {
            ceremony_id: c.id.clone(),
            master_task: c.master_task.clone(),
            status: c.status,
            revision: c.revision,
            retries_used: c.retries_used,
            retry_budget: c.retry_budget,
            reason: c.reason.clone(),
            summary: task::summarize(&ledger.tasks),
            tasks: ledger.tasks.clone(),
            outstanding: ledger
                .tasks
                .iter()
                .filter(|t| t.status != TaskStatus::Complete)
                .map(TaskFailure::from_task)
                .collect(),
        }
    }
}
