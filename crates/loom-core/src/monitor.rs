//! Stall detection and replay planning.
//!
//! Everything here is a pure function of a ledger snapshot: it returns the
//! events that would recover a task, and the orchestrator commits them
//! under the ledger's revision check.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::error::{LoomError, Result};
use crate::ledger::{EventKind, Ledger};
use crate::task::{self, Task};
use crate::types::{ReplayMode, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct Stall {
    pub task_id: String,
    pub worker_id: String,
    pub reason: String,
}

/// In-flight tasks whose worker missed its heartbeat deadline or whose
/// worker handle is known dead.
pub fn detect_stalls(
    ledger: &Ledger,
    now: DateTime<Utc>,
    timeout: Duration,
    dead_workers: &HashSet<String>,
) -> Vec<Stall> {
    ledger
        .tasks
        .iter()
        .filter(|t| t.status.is_in_flight())
        .filter_map(|t| {
            let worker = t.assignee.clone()?;
            if dead_workers.contains(&worker) {
                return Some(Stall {
                    task_id: t.id.clone(),
                    reason: format!("worker '{worker}' exited while task '{}' was {}", t.id, t.status),
                    worker_id: worker,
                });
            }
            let last = t.heartbeat.unwrap_or(ledger.ceremony.created_at);
            let elapsed = now - last;
            if elapsed <= timeout {
                return None;
            }
            let reason = LoomError::WorkerTimeout {
                task: t.id.clone(),
                worker: worker.clone(),
                elapsed_secs: elapsed.num_seconds(),
            }
            .to_string();
            Some(Stall {
                task_id: t.id.clone(),
                worker_id: worker,
                reason,
            })
        })
        .collect()
}

/// Replay mode for an automatic recovery. RESUME with nothing to resume
/// from is a RESTART.
pub fn choose_mode(task: &Task, default: ReplayMode) -> ReplayMode {
    match default {
        ReplayMode::Resume if !has_partial_output(task) => ReplayMode::Restart,
        mode => mode,
    }
}

fn has_partial_output(task: &Task) -> bool {
    task.output_partial && task.output.is_some()
}

/// Events that put `task_id` back in line for another offer under `mode`,
/// or settle it as exhausted when a budget-consuming replay has no budget
/// left.
pub fn recovery_plan(
    ledger: &Ledger,
    task_id: &str,
    mode: ReplayMode,
    reason: &str,
) -> Result<Vec<EventKind>> {
    let t = ledger.task(task_id)?;
    if mode.consumes_budget() {
        if !ledger.budget_left(t) {
            return Ok(vec![EventKind::Exhausted {
                task: t.id.clone(),
                reason: format!("{reason}; no attempts left after {}", t.attempts),
            }]);
        }
        if !ledger.global_budget_left() {
            return Ok(vec![EventKind::Exhausted {
                task: t.id.clone(),
                reason: format!(
                    "{reason}; ceremony retry budget of {} is spent",
                    ledger.ceremony.retry_budget
                ),
            }]);
        }
    }

    let mut events = Vec::new();
    let keep_output = mode.keeps_partial_output() && has_partial_output(t);
    if keep_output {
        if let Some(partial) = &t.output {
            events.push(EventKind::Noted {
                task: Some(t.id.clone()),
                text: format!(
                    "Partial output of {} from attempt {}:\n{partial}",
                    t.id, t.attempts
                ),
            });
        }
    }
    events.push(EventKind::Reverted {
        task: t.id.clone(),
        reason: format!("{reason}; replaying ({mode})"),
        replay: Some(mode),
        keep_output,
        charged: mode.consumes_budget(),
    });

    let cause = format!("upstream task '{}' is being replayed", t.id);
    for dep_id in task::transitive_dependents(&ledger.tasks, &t.id) {
        let dep = ledger.task(&dep_id)?;
        let reset = match mode {
            ReplayMode::Selective => dep.status != TaskStatus::Pending,
            // Dependents that were blocked by this task get another chance.
            _ => dep.status == TaskStatus::Failed && dep.exhausted,
        };
        if reset {
            events.push(EventKind::Superseded {
                task: dep_id,
                cause: cause.clone(),
            });
        }
    }
    Ok(events)
}
