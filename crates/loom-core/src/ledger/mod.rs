//! The Ledger: one versioned document per ceremony, the only channel of
//! coordination between the orchestrator and its workers.
//!
//! # Document sections
//!
//! ```text
//! ceremony:        id, master task, created_at, status, revision, budgets
//! tasks:           id, description, dependencies, status, assignee,
//!                  output, attempts, heartbeat
//! shared_context:  notes visible to every worker
//! events:          append-only, ordered log
//! ```
//!
//! State is never edited directly. Every change is an [`EventKind`] passed
//! through [`Ledger::apply`], which validates the transition, mutates the
//! tables and appends the event. [`Ledger::rebuild`] folds a log back into
//! the same tables.

pub mod db;
pub mod event;
pub mod file;
pub mod store;

pub use db::RedbLedgerStore;
pub use event::{Event, EventKind};
pub use file::FileLedgerStore;
pub use store::{blocking, update, update_blocking, LedgerStore, RetryPolicy};

use crate::consent;
use crate::error::{LoomError, Result};
use crate::paths;
use crate::task::{self, Task, TaskGraph};
use crate::types::{CeremonyStatus, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Ceremony / ContextNote
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ceremony {
    pub id: String,
    pub master_task: String,
    pub created_at: DateTime<Utc>,
    pub status: CeremonyStatus,
    /// Bumped by the store on every successful write.
    #[serde(default)]
    pub revision: u64,
    pub max_attempts: u32,
    pub retry_budget: u32,
    #[serde(default)]
    pub retries_used: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextNote {
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub task: Option<String>,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub ceremony: Ceremony,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub shared_context: Vec<ContextNote>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Ledger {
    /// Fresh ledger for a decomposed master task.
    pub fn begin(
        id: &str,
        master_task: &str,
        graph: &TaskGraph,
        max_attempts: u32,
        retry_budget: u32,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        paths::validate_id(id)?;
        graph.validate()?;
        let mut ledger = Self::empty(id, at);
        ledger.apply(
            EventKind::Begun {
                master_task: master_task.to_string(),
                max_attempts,
                retry_budget,
                tasks: graph.tasks.clone(),
            },
            at,
        )?;
        Ok(ledger)
    }

    /// Reconstruct ceremony and task state from an event log alone.
    pub fn rebuild(id: &str, events: &[Event]) -> Result<Self> {
        let first = events
            .first()
            .ok_or_else(|| LoomError::Store(format!("ceremony '{id}' has an empty event log")))?;
        if !matches!(first.event, EventKind::Begun { .. }) {
            return Err(LoomError::Store(format!(
                "ceremony '{id}' log does not start with 'begun'"
            )));
        }
        let mut ledger = Self::empty(id, first.at);
        for event in events {
            ledger.apply(event.event.clone(), event.at)?;
        }
        Ok(ledger)
    }

    fn empty(id: &str, at: DateTime<Utc>) -> Self {
        Self {
            ceremony: Ceremony {
                id: id.to_string(),
                master_task: String::new(),
                created_at: at,
                status: CeremonyStatus::Active,
                revision: 0,
                max_attempts: 0,
                retry_budget: 0,
                retries_used: 0,
                reason: None,
            },
            tasks: Vec::new(),
            shared_context: Vec::new(),
            events: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Document format
    // -----------------------------------------------------------------------

    pub fn to_document(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_document(doc: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(doc)?)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.ceremony.id
    }

    pub fn status(&self) -> CeremonyStatus {
        self.ceremony.status
    }

    pub fn task(&self, id: &str) -> Result<&Task> {
        task::find(&self.tasks, id)
    }

    /// Whether another invitation may be charged to `task`.
    pub fn budget_left(&self, task: &Task) -> bool {
        task.attempts < self.ceremony.max_attempts
    }

    pub fn global_budget_left(&self) -> bool {
        self.ceremony.retries_used < self.ceremony.retry_budget
    }

    /// Every task is COMPLETE or exhausted.
    pub fn is_settled(&self) -> bool {
        self.tasks.iter().all(Task::is_terminal)
    }

    pub fn shared_context_text(&self) -> String {
        self.shared_context
            .iter()
            .map(|n| match &n.task {
                Some(t) => format!("[{t}] {}", n.text),
                None => n.text.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Final outputs of the task's dependencies, in declaration order.
    pub fn dependency_outputs(&self, task: &Task) -> Vec<(String, String)> {
        task.depends_on
            .iter()
            .filter_map(|dep| {
                let t = self.tasks.iter().find(|t| &t.id == dep)?;
                match (&t.status, &t.output) {
                    (TaskStatus::Complete, Some(out)) => Some((dep.clone(), out.clone())),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn events_for<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.events
            .iter()
            .filter(move |e| e.event.task_id() == Some(task_id))
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Validate and apply one event, then append it to the log.
    pub fn apply(&mut self, kind: EventKind, at: DateTime<Utc>) -> Result<()> {
        self.transition(&kind, at)?;
        let seq = self.events.len() as u64 + 1;
        self.events.push(Event {
            seq,
            at,
            event: kind,
        });
        Ok(())
    }

    /// `apply` stamped with the current time.
    pub fn record(&mut self, kind: EventKind) -> Result<()> {
        self.apply(kind, Utc::now())
    }

    fn transition(&mut self, kind: &EventKind, at: DateTime<Utc>) -> Result<()> {
        match kind {
            EventKind::Begun {
                master_task,
                max_attempts,
                retry_budget,
                tasks,
            } => {
                if !self.events.is_empty() {
                    return Err(LoomError::CeremonyExists(self.ceremony.id.clone()));
                }
                self.ceremony.master_task = master_task.clone();
                self.ceremony.max_attempts = *max_attempts;
                self.ceremony.retry_budget = *retry_budget;
                self.ceremony.created_at = at;
                self.tasks = tasks.iter().map(Task::from_spec).collect();
            }

            EventKind::Invited { invitation } => {
                if self.ceremony.status != CeremonyStatus::Active {
                    return Err(LoomError::InvalidTransition {
                        task: invitation.task_id.clone(),
                        from: self.task(&invitation.task_id)?.status,
                        to: TaskStatus::Offered,
                        reason: format!("ceremony is {}", self.ceremony.status),
                    });
                }
                let ready = {
                    let t = self.task(&invitation.task_id)?;
                    task::dependencies_complete(&self.tasks, t)
                };
                let t = self.task_in(&invitation.task_id, &[TaskStatus::Pending], TaskStatus::Offered)?;
                if !ready {
                    return Err(LoomError::InvalidTransition {
                        task: t.id.clone(),
                        from: t.status,
                        to: TaskStatus::Offered,
                        reason: "dependencies are not all COMPLETE".into(),
                    });
                }
                t.status = TaskStatus::Offered;
                t.assignee = Some(invitation.worker_id.clone());
                t.attempts = invitation.attempt;
                t.heartbeat = Some(at);
                t.replay = invitation.replay;
                t.last_response = None;
            }

            EventKind::Responded {
                task,
                worker,
                response,
            } => {
                let to = if response.is_accept() {
                    TaskStatus::Accepted
                } else {
                    TaskStatus::Declined
                };
                let t = self.held_in(task, worker, &[TaskStatus::Offered], to)?;
                t.status = to;
                t.last_response = Some(response.clone());
                t.heartbeat = Some(at);
                if let Some(reason) = match response {
                    consent::Response::Accept => None,
                    consent::Response::Decline { reason } => Some(reason.clone()),
                    consent::Response::ProposeAlternative { text }
                    | consent::Response::RequestClarification { text } => Some(text.clone()),
                } {
                    t.reason = Some(reason);
                }
            }

            EventKind::Started { task, worker } => {
                let t = self.held_in(task, worker, &[TaskStatus::Accepted], TaskStatus::InProgress)?;
                if !consent::may_start(t.last_response.as_ref()) {
                    return Err(LoomError::InvalidTransition {
                        task: task.clone(),
                        from: t.status,
                        to: TaskStatus::InProgress,
                        reason: "no recorded ACCEPT".into(),
                    });
                }
                t.status = TaskStatus::InProgress;
                t.heartbeat = Some(at);
            }

            EventKind::Heartbeat { task, worker } => {
                let t = self.held_in(
                    task,
                    worker,
                    &[TaskStatus::Offered, TaskStatus::Accepted, TaskStatus::InProgress],
                    TaskStatus::InProgress,
                )?;
                t.heartbeat = Some(at);
            }

            EventKind::Checkpointed {
                task,
                worker,
                partial_output,
            } => {
                let t = self.held_in(task, worker, &[TaskStatus::InProgress], TaskStatus::InProgress)?;
                t.output = Some(partial_output.clone());
                t.output_partial = true;
                t.heartbeat = Some(at);
            }

            EventKind::Completed {
                task,
                worker,
                output,
            } => {
                let t = self.held_in(task, worker, &[TaskStatus::InProgress], TaskStatus::Complete)?;
                t.status = TaskStatus::Complete;
                t.output = Some(output.clone());
                t.output_partial = false;
                t.heartbeat = Some(at);
                t.replay = None;
                t.reason = None;
            }

            EventKind::WorkFailed {
                task,
                worker,
                reason,
            } => {
                let t = self.held_in(
                    task,
                    worker,
                    &[TaskStatus::Accepted, TaskStatus::InProgress],
                    TaskStatus::Failed,
                )?;
                t.status = TaskStatus::Failed;
                t.reason = Some(reason.clone());
                t.heartbeat = Some(at);
            }

            EventKind::Reverted {
                task,
                reason,
                replay,
                keep_output,
                charged,
            } => {
                let t = self.task_in(
                    task,
                    &[
                        TaskStatus::Offered,
                        TaskStatus::Accepted,
                        TaskStatus::InProgress,
                        TaskStatus::Declined,
                        TaskStatus::Failed,
                    ],
                    TaskStatus::Pending,
                )?;
                t.status = TaskStatus::Pending;
                t.assignee = None;
                t.exhausted = false;
                t.replay = *replay;
                t.reason = Some(reason.clone());
                if !keep_output {
                    t.output = None;
                    t.output_partial = false;
                }
                if *charged {
                    self.ceremony.retries_used += 1;
                }
            }

            EventKind::Superseded { task, cause } => {
                let t = task::find_mut(&mut self.tasks, task)?;
                if t.status == TaskStatus::Pending {
                    return Err(LoomError::InvalidTransition {
                        task: task.clone(),
                        from: t.status,
                        to: TaskStatus::Pending,
                        reason: "already pending".into(),
                    });
                }
                t.status = TaskStatus::Pending;
                t.assignee = None;
                t.output = None;
                t.output_partial = false;
                t.exhausted = false;
                t.replay = None;
                t.reason = Some(cause.clone());
            }

            EventKind::Exhausted { task, reason } => {
                let t = task::find_mut(&mut self.tasks, task)?;
                if t.status == TaskStatus::Complete || t.exhausted {
                    return Err(LoomError::InvalidTransition {
                        task: task.clone(),
                        from: t.status,
                        to: TaskStatus::Failed,
                        reason: "task is already terminal".into(),
                    });
                }
                t.status = TaskStatus::Failed;
                t.exhausted = true;
                t.assignee = None;
                t.reason = Some(reason.clone());
            }

            EventKind::Noted { task, text } => {
                if let Some(id) = task {
                    self.task(id)?;
                }
                self.shared_context.push(ContextNote {
                    at,
                    task: task.clone(),
                    text: text.clone(),
                });
            }

            EventKind::StatusChanged { status, reason } => {
                let from = self.ceremony.status;
                let allowed = match from {
                    CeremonyStatus::Active => *status != CeremonyStatus::Active,
                    CeremonyStatus::Degraded => matches!(
                        status,
                        CeremonyStatus::Active | CeremonyStatus::Abandoned
                    ),
                    CeremonyStatus::Complete | CeremonyStatus::Abandoned => false,
                };
                if !allowed {
                    return Err(LoomError::Store(format!(
                        "ceremony '{}' cannot move from {from} to {status}",
                        self.ceremony.id
                    )));
                }
                self.ceremony.status = *status;
                self.ceremony.reason = reason.clone();
            }
        }
        Ok(())
    }

    fn task_in(
        &mut self,
        id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<&mut Task> {
        let t = task::find_mut(&mut self.tasks, id)?;
        if !from.contains(&t.status) {
            return Err(LoomError::InvalidTransition {
                task: id.to_string(),
                from: t.status,
                to,
                reason: format!(
                    "expected one of {}",
                    from.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                ),
            });
        }
        Ok(t)
    }

    /// Worker writes are fenced on the current assignee.
    fn held_in(
        &mut self,
        id: &str,
        worker: &str,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<&mut Task> {
        {
            let t = task::find(&self.tasks, id)?;
            if !t.is_held_by(worker) {
                return Err(LoomError::StaleWorker {
                    task: id.to_string(),
                    worker: worker.to_string(),
                });
            }
        }
        self.task_in(id, from, to)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::{Invitation, Response};
    use crate::task::TaskSpec;

    fn chain() -> Ledger {
        let graph = TaskGraph::new(vec![
            TaskSpec::new("T1", "outline the report"),
            TaskSpec::new("T2", "write the body").depends_on(["T1"]),
        ]);
        Ledger::begin("c1", "write a report", &graph, 3, 10, Utc::now()).unwrap()
    }

    fn invite(ledger: &mut Ledger, task: &str, worker: &str, attempt: u32) -> Result<()> {
        ledger.record(EventKind::Invited {
            invitation: Invitation {
                ceremony_id: "c1".into(),
                task_id: task.into(),
                worker_id: worker.into(),
                description: String::new(),
                expected_benefit: String::new(),
                attempt,
                replay: None,
                resume_from: None,
            },
        })
    }

    fn run_to_complete(ledger: &mut Ledger, task: &str, worker: &str, output: &str) {
        invite(ledger, task, worker, 1).unwrap();
        ledger
            .record(EventKind::Responded {
                task: task.into(),
                worker: worker.into(),
                response: Response::Accept,
            })
            .unwrap();
        ledger
            .record(EventKind::Started {
                task: task.into(),
                worker: worker.into(),
            })
            .unwrap();
        ledger
            .record(EventKind::Completed {
                task: task.into(),
                worker: worker.into(),
                output: output.into(),
            })
            .unwrap();
    }

    #[test]
    fn begin_creates_pending_tasks_and_log() {
        let ledger = chain();
        assert_eq!(ledger.tasks.len(), 2);
        assert!(ledger.tasks.iter().all(|t| t.status == TaskStatus::Pending));
        assert_eq!(ledger.events.len(), 1);
        assert_eq!(ledger.events[0].seq, 1);
        assert_eq!(ledger.ceremony.max_attempts, 3);
    }

    #[test]
    fn offer_requires_complete_dependencies() {
        let mut ledger = chain();
        let err = invite(&mut ledger, "T2", "w1", 1).unwrap_err();
        assert!(matches!(err, LoomError::InvalidTransition { .. }), "{err}");

        run_to_complete(&mut ledger, "T1", "w1", "outline");
        invite(&mut ledger, "T2", "w2", 1).unwrap();
        assert_eq!(ledger.task("T2").unwrap().status, TaskStatus::Offered);
    }

    #[test]
    fn start_requires_recorded_accept() {
        let mut ledger = chain();
        invite(&mut ledger, "T1", "w1", 1).unwrap();
        let err = ledger
            .record(EventKind::Started {
                task: "T1".into(),
                worker: "w1".into(),
            })
            .unwrap_err();
        assert!(matches!(err, LoomError::InvalidTransition { .. }));

        ledger
            .record(EventKind::Responded {
                task: "T1".into(),
                worker: "w1".into(),
                response: Response::Decline {
                    reason: "not my area".into(),
                },
            })
            .unwrap();
        assert_eq!(ledger.task("T1").unwrap().status, TaskStatus::Declined);
        assert!(ledger
            .record(EventKind::Started {
                task: "T1".into(),
                worker: "w1".into(),
            })
            .is_err());
    }

    #[test]
    fn writes_from_another_worker_are_fenced() {
        let mut ledger = chain();
        invite(&mut ledger, "T1", "w1", 1).unwrap();
        let err = ledger
            .record(EventKind::Responded {
                task: "T1".into(),
                worker: "w2".into(),
                response: Response::Accept,
            })
            .unwrap_err();
        assert!(matches!(err, LoomError::StaleWorker { .. }));
    }

    #[test]
    fn revert_keeps_or_clears_partial_output() {
        let mut ledger = chain();
        invite(&mut ledger, "T1", "w1", 1).unwrap();
        for kind in [
            EventKind::Responded {
                task: "T1".into(),
                worker: "w1".into(),
                response: Response::Accept,
            },
            EventKind::Started {
                task: "T1".into(),
                worker: "w1".into(),
            },
            EventKind::Checkpointed {
                task: "T1".into(),
                worker: "w1".into(),
                partial_output: "half an outline".into(),
            },
            EventKind::Reverted {
                task: "T1".into(),
                reason: "stalled".into(),
                replay: None,
                keep_output: true,
                charged: true,
            },
        ] {
            ledger.record(kind).unwrap();
        }
        let t = ledger.task("T1").unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.output.as_deref(), Some("half an outline"));
        assert!(t.output_partial);
        assert!(t.assignee.is_none());
        assert_eq!(ledger.ceremony.retries_used, 1);
    }

    #[test]
    fn document_roundtrip_preserves_task_table() {
        let mut ledger = chain();
        run_to_complete(&mut ledger, "T1", "w1", "outline:\n  - intro\n  - body");
        ledger
            .record(EventKind::Noted {
                task: Some("T1".into()),
                text: "keep it short".into(),
            })
            .unwrap();
        let doc = ledger.to_document().unwrap();
        let parsed = Ledger::from_document(&doc).unwrap();
        assert_eq!(parsed.tasks, ledger.tasks);
        assert_eq!(parsed, ledger);
    }

    #[test]
    fn rebuild_from_log_matches_live_state() {
        let mut ledger = chain();
        run_to_complete(&mut ledger, "T1", "w1", "outline");
        invite(&mut ledger, "T2", "w2", 1).unwrap();
        ledger
            .record(EventKind::Responded {
                task: "T2".into(),
                worker: "w2".into(),
                response: Response::RequestClarification {
                    text: "how long?".into(),
                },
            })
            .unwrap();

        let rebuilt = Ledger::rebuild("c1", &ledger.events).unwrap();
        assert_eq!(rebuilt.tasks, ledger.tasks);
        assert_eq!(rebuilt.ceremony.status, ledger.ceremony.status);
        assert_eq!(rebuilt.events, ledger.events);
    }

    #[test]
    fn terminal_ceremony_status_is_final() {
        let mut ledger = chain();
        ledger
            .record(EventKind::StatusChanged {
                status: CeremonyStatus::Abandoned,
                reason: Some("operator".into()),
            })
            .unwrap();
        assert!(ledger
            .record(EventKind::StatusChanged {
                status: CeremonyStatus::Active,
                reason: None,
            })
            .is_err());
        assert!(invite(&mut ledger, "T1", "w1", 1).is_err());
    }
}
