//! The Loom: ceremony lifecycle on top of the ledger, the transport and the
//! monitor.
//!
//! # One `advance`
//!
//! 1. Ask the transport which tracked workers are dead.
//! 2. Resolve, in one ledger write: stalls (replay), DECLINED tasks
//!    (reassign, clarify or fail), FAILED tasks (retry or exhaust), pending
//!    tasks blocked by an exhausted dependency, and the ceremony status once
//!    every task is settled.
//! 3. Reap handles whose task no longer belongs to them.
//! 4. Offer every ready task in one ledger write, then spawn a worker per
//!    invitation.
//!
//! Every write is planned against a fresh snapshot and committed under the
//! snapshot's revision, so a step with nothing to do writes nothing and
//! `advance` can be called as often as the caller likes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::consent::{self, Decision, Invitation};
use crate::decompose::Decomposer;
use crate::error::{LoomError, Result};
use crate::ledger::{blocking, EventKind, Ledger, LedgerStore, RetryPolicy};
use crate::monitor;
use crate::synthesis::{CeremonyReport, Synthesis};
use crate::task::{self, Task};
use crate::transport::{self, Transport, WorkerHandle, WorkerSpec};
use crate::types::{CeremonyStatus, ReplayMode, TaskStatus};

/// What one `advance` did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdvanceReport {
    pub ceremony_id: String,
    pub status: Option<CeremonyStatus>,
    pub revision: u64,
    /// Successful ledger writes.
    pub mutations: usize,
    pub recovered: Vec<String>,
    pub offered: Vec<String>,
    pub spawned: Vec<String>,
    pub reaped: Vec<String>,
}

pub struct Loom {
    store: Arc<dyn LedgerStore>,
    transport: Arc<dyn Transport>,
    decomposer: Arc<dyn Decomposer>,
    config: Config,
    heartbeat_timeout: Duration,
    poll_interval: Duration,
    handles: tokio::sync::Mutex<HashMap<String, WorkerHandle>>,
}

impl Loom {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        transport: Arc<dyn Transport>,
        decomposer: Arc<dyn Decomposer>,
        config: Config,
    ) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            poll_interval: config.poll_interval(),
            store,
            transport,
            decomposer,
            config,
            handles: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -----------------------------------------------------------------------
    // begin_ceremony
    // -----------------------------------------------------------------------

    /// Decompose `master_task` and persist the initial ledger. A master task
    /// that does not split into at least two tasks is a
    /// [`LoomError::Decomposition`]: run it directly instead.
    pub async fn begin_ceremony(&self, master_task: &str) -> Result<String> {
        let graph = self
            .decomposer
            .decompose(master_task)
            .await
            .map_err(|e| match e {
                LoomError::Decomposition(_) => e,
                other => LoomError::Decomposition(other.to_string()),
            })?;
        if graph.tasks.len() < 2 {
            return Err(LoomError::Decomposition(format!(
                "master task split into {} task(s); execute it directly",
                graph.tasks.len()
            )));
        }
        graph
            .validate()
            .map_err(|e| LoomError::Decomposition(e.to_string()))?;

        let id = new_ceremony_id();
        let ledger = Ledger::begin(
            &id,
            master_task,
            &graph,
            self.config.max_attempts,
            self.config.global_retry_budget,
            Utc::now(),
        )?;
        blocking(&self.store, move |store| store.create(&ledger)).await?;
        tracing::info!(
            ceremony = %id,
            tasks = graph.tasks.len(),
            "ceremony begun"
        );
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // advance
    // -----------------------------------------------------------------------

    pub async fn advance(&self, ceremony_id: &str) -> Result<AdvanceReport> {
        let mut report = AdvanceReport {
            ceremony_id: ceremony_id.to_string(),
            ..AdvanceReport::default()
        };

        let dead = self.dead_workers(ceremony_id).await;

        let timeout = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
        let default_mode = self.config.replay.default_mode;
        let mut recovered = Vec::new();
        if self
            .commit(ceremony_id, |ledger| {
                recovered.clear();
                resolve(ledger, &dead, timeout, default_mode, &mut recovered)
            })
            .await?
            .is_some()
        {
            report.mutations += 1;
        }
        report.recovered = recovered;

        let (ledger, _) = self.read(ceremony_id).await?;
        report.reaped = self.reap(&ledger, &dead).await;

        if ledger.status() == CeremonyStatus::Active {
            let mut invitations = Vec::new();
            if self
                .commit(ceremony_id, |ledger| {
                    invitations = offers(ledger);
                    Ok(invitations
                        .iter()
                        .map(|inv| EventKind::Invited {
                            invitation: inv.clone(),
                        })
                        .collect())
                })
                .await?
                .is_some()
            {
                report.mutations += 1;
            }
            for inv in invitations {
                report.offered.push(inv.task_id.clone());
                match self.spawn(ceremony_id, &inv).await {
                    Ok(()) => report.spawned.push(inv.task_id.clone()),
                    Err(e) => {
                        if self.revert_failed_spawn(&inv, &e).await? {
                            report.mutations += 1;
                        }
                    }
                }
            }
        }

        let (ledger, revision) = self.read(ceremony_id).await?;
        report.status = Some(ledger.status());
        report.revision = revision;
        if report.mutations > 0 {
            tracing::debug!(
                ceremony = ceremony_id,
                revision,
                summary = %task::summarize(&ledger.tasks),
                "advanced"
            );
        }
        Ok(report)
    }

    /// Drive `advance` until the ceremony settles, waking on ledger
    /// changes made through this store and on the poll interval.
    pub async fn run(&self, ceremony_id: &str) -> Result<CeremonyStatus> {
        let mut changes = self.store.subscribe();
        loop {
            let report = self.advance(ceremony_id).await?;
            if let Some(status) = report.status.filter(|s| s.is_terminal()) {
                self.terminate_all(ceremony_id).await;
                tracing::info!(ceremony = ceremony_id, %status, "ceremony finished");
                return Ok(status);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                msg = changes.recv() => match msg {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => tokio::time::sleep(self.poll_interval).await,
                },
            }
        }
    }

    // -----------------------------------------------------------------------
    // synthesize / report
    // -----------------------------------------------------------------------

    /// The final artifact. COMPLETE and DEGRADED ceremonies synthesize
    /// (DEGRADED with gaps); an ABANDONED one returns its best partial
    /// synthesis inside [`LoomError::CeremonyAbandoned`].
    pub fn synthesize(&self, ceremony_id: &str) -> Result<Synthesis> {
        let (ledger, _) = self.store.read(ceremony_id)?;
        match ledger.status() {
            CeremonyStatus::Active => Err(LoomError::IncompleteCeremony {
                id: ceremony_id.to_string(),
                status: CeremonyStatus::Active,
            }),
            CeremonyStatus::Complete | CeremonyStatus::Degraded => Ok(Synthesis::from_ledger(&ledger)),
            CeremonyStatus::Abandoned => Err(LoomError::CeremonyAbandoned {
                partial: Box::new(Synthesis::from_ledger(&ledger)),
            }),
        }
    }

    pub fn report(&self, ceremony_id: &str) -> Result<CeremonyReport> {
        let (ledger, _) = self.store.read(ceremony_id)?;
        Ok(CeremonyReport::from_ledger(&ledger))
    }

    // -----------------------------------------------------------------------
    // abandon / replay
    // -----------------------------------------------------------------------

    pub async fn abandon(&self, ceremony_id: &str, reason: &str) -> Result<()> {
        self.commit(ceremony_id, |ledger| {
            if ledger.status() == CeremonyStatus::Abandoned {
                return Ok(Vec::new());
            }
            Ok(vec![EventKind::StatusChanged {
                status: CeremonyStatus::Abandoned,
                reason: Some(reason.to_string()),
            }])
        })
        .await?;
        self.terminate_all(ceremony_id).await;
        tracing::warn!(ceremony = ceremony_id, reason, "ceremony abandoned");
        Ok(())
    }

    /// Operator-requested replay of one task. The next `advance` reaps any
    /// worker still bound to it and offers it again.
    pub async fn replay(&self, ceremony_id: &str, task_id: &str, mode: ReplayMode) -> Result<()> {
        self.commit(ceremony_id, |ledger| {
            let t = ledger.task(task_id)?;
            if matches!(
                ledger.status(),
                CeremonyStatus::Complete | CeremonyStatus::Abandoned
            ) {
                return Err(LoomError::InvalidTransition {
                    task: task_id.to_string(),
                    from: t.status,
                    to: TaskStatus::Pending,
                    reason: format!("ceremony is {}", ledger.status()),
                });
            }
            if mode.consumes_budget() && !(ledger.budget_left(t) && ledger.global_budget_left()) {
                return Err(LoomError::InvalidTransition {
                    task: task_id.to_string(),
                    from: t.status,
                    to: TaskStatus::Pending,
                    reason: "retry budget exhausted; only a debug replay is free".into(),
                });
            }
            let mut scratch = ledger.clone();
            let mut events = Vec::new();
            if scratch.status() == CeremonyStatus::Degraded {
                push(
                    &mut scratch,
                    &mut events,
                    EventKind::StatusChanged {
                        status: CeremonyStatus::Active,
                        reason: Some(format!("{mode} replay of '{task_id}'")),
                    },
                )?;
            }
            let plan = monitor::recovery_plan(
                &scratch,
                task_id,
                mode,
                &format!("operator requested {mode} replay"),
            )?;
            for e in plan {
                push(&mut scratch, &mut events, e)?;
            }
            Ok(events)
        })
        .await?;
        tracing::info!(ceremony = ceremony_id, task = task_id, %mode, "replay requested");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Plan events against a fresh snapshot and write them under its
    /// revision, re-planning on conflict. An empty plan writes nothing.
    async fn commit<P>(&self, ceremony_id: &str, mut plan: P) -> Result<Option<u64>>
    where
        P: FnMut(&Ledger) -> Result<Vec<EventKind>>,
    {
        let policy: RetryPolicy = self.config.conflict_retry;
        let mut retry = 0;
        loop {
            let (ledger, revision) = self.read(ceremony_id).await?;
            let events = plan(&ledger)?;
            if events.is_empty() {
                return Ok(None);
            }
            let now = Utc::now();
            let id = ceremony_id.to_string();
            let result = blocking(&self.store, move |store| {
                store.write(&id, revision, &mut |l: &mut Ledger| {
                    for e in &events {
                        l.apply(e.clone(), now)?;
                    }
                    Ok(())
                })
            })
            .await;
            match result {
                Ok(rev) => return Ok(Some(rev)),
                Err(LoomError::RevisionConflict { expected, actual }) if retry + 1 < policy.attempts => {
                    retry += 1;
                    tracing::debug!(
                        ceremony = ceremony_id,
                        expected,
                        actual,
                        retry,
                        "replanning after conflict"
                    );
                    tokio::time::sleep(policy.delay(retry)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read(&self, ceremony_id: &str) -> Result<(Ledger, u64)> {
        let id = ceremony_id.to_string();
        blocking(&self.store, move |store| store.read(&id)).await
    }

    async fn dead_workers(&self, ceremony_id: &str) -> HashSet<String> {
        let tracked: Vec<WorkerHandle> = self
            .handles
            .lock()
            .await
            .values()
            .filter(|h| h.ceremony_id == ceremony_id)
            .cloned()
            .collect();
        let mut dead = HashSet::new();
        for h in tracked {
            if !self.transport.is_alive(&h).await {
                dead.insert(h.worker_id);
            }
        }
        dead
    }

    /// Drop handles that no longer hold an in-flight task, terminating any
    /// that are still running.
    async fn reap(&self, ledger: &Ledger, dead: &HashSet<String>) -> Vec<String> {
        let mut reaped = Vec::new();
        let mut handles = self.handles.lock().await;
        let stale: Vec<WorkerHandle> = handles
            .values()
            .filter(|h| h.ceremony_id == ledger.id())
            .filter(|h| {
                dead.contains(&h.worker_id)
                    || !ledger
                        .task(&h.task_id)
                        .map(|t| t.is_held_by(&h.worker_id) && t.status.is_in_flight())
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        for h in stale {
            handles.remove(&h.worker_id);
            if let Err(e) = self.transport.terminate(&h).await {
                tracing::warn!(worker = %h.worker_id, error = %e, "failed to terminate worker");
            }
            reaped.push(h.task_id);
        }
        reaped
    }

    async fn terminate_all(&self, ceremony_id: &str) {
        let mut handles = self.handles.lock().await;
        let ids: Vec<String> = handles
            .values()
            .filter(|h| h.ceremony_id == ceremony_id)
            .map(|h| h.worker_id.clone())
            .collect();
        for id in ids {
            if let Some(h) = handles.remove(&id) {
                if let Err(e) = self.transport.terminate(&h).await {
                    tracing::warn!(worker = %h.worker_id, error = %e, "failed to terminate worker");
                }
            }
        }
    }

    async fn spawn(&self, ceremony_id: &str, inv: &Invitation) -> Result<()> {
        let spec = WorkerSpec {
            ceremony_id: ceremony_id.to_string(),
            task_id: inv.task_id.clone(),
            worker_id: inv.worker_id.clone(),
            ledger: self.store.location(ceremony_id),
            debug: inv.replay == Some(ReplayMode::Debug),
        };
        let policy = self.config.spawn_retry;
        let mut retry = 0;
        loop {
            match self.transport.spawn(spec.clone()).await {
                Ok(handle) => {
                    tracing::info!(
                        ceremony = ceremony_id,
                        task = %inv.task_id,
                        worker = %inv.worker_id,
                        attempt = inv.attempt,
                        transport = %self.transport.kind(),
                        "worker spawned"
                    );
                    self.handles
                        .lock()
                        .await
                        .insert(handle.worker_id.clone(), handle);
                    return Ok(());
                }
                Err(e) if e.is_transient() && retry + 1 < policy.attempts => {
                    retry += 1;
                    tracing::warn!(task = %inv.task_id, error = %e, retry, "spawn failed, retrying");
                    tokio::time::sleep(policy.delay(retry)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Put a task whose worker never started back in line. Charged, so a
    /// transport that keeps failing ends the ceremony instead of looping.
    async fn revert_failed_spawn(&self, inv: &Invitation, err: &LoomError) -> Result<bool> {
        tracing::error!(task = %inv.task_id, error = %err, "giving up on spawning worker");
        let reason = err.to_string();
        let written = self
            .commit(&inv.ceremony_id, |ledger| {
                let t = ledger.task(&inv.task_id)?;
                if !(t.is_held_by(&inv.worker_id) && t.status == TaskStatus::Offered) {
                    return Ok(Vec::new());
                }
                Ok(vec![EventKind::Reverted {
                    task: inv.task_id.clone(),
                    reason: reason.clone(),
                    replay: inv.replay,
                    keep_output: true,
                    charged: true,
                }])
            })
            .await?;
        Ok(written.is_some())
    }
}

pub fn new_ceremony_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("c-{}", &uuid[..12])
}

// ---------------------------------------------------------------------------
// Planning (pure)
// ---------------------------------------------------------------------------

fn push(scratch: &mut Ledger, events: &mut Vec<EventKind>, e: EventKind) -> Result<()> {
    scratch.record(e.clone())?;
    events.push(e);
    Ok(())
}

/// Everything `advance` decides from ledger state alone.
fn resolve(
    ledger: &Ledger,
    dead: &HashSet<String>,
    timeout: chrono::Duration,
    default_mode: ReplayMode,
    recovered: &mut Vec<String>,
) -> Result<Vec<EventKind>> {
    let mut scratch = ledger.clone();
    let mut events = Vec::new();
    if scratch.status() != CeremonyStatus::Active {
        return Ok(events);
    }

    for stall in monitor::detect_stalls(&scratch, Utc::now(), timeout, dead) {
        let t = scratch.task(&stall.task_id)?;
        let mode = monitor::choose_mode(t, default_mode);
        tracing::warn!(
            task = %stall.task_id,
            worker = %stall.worker_id,
            %mode,
            reason = %stall.reason,
            "stalled task"
        );
        for e in monitor::recovery_plan(&scratch, &stall.task_id, mode, &stall.reason)? {
            push(&mut scratch, &mut events, e)?;
        }
        recovered.push(stall.task_id);
    }

    let settling: Vec<Task> = scratch
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Declined || (t.status == TaskStatus::Failed && !t.exhausted))
        .cloned()
        .collect();
    for t in settling {
        if t.status == TaskStatus::Declined {
            for e in resolve_decline(&scratch, &t) {
                push(&mut scratch, &mut events, e)?;
            }
        } else {
            let mode = monitor::choose_mode(&t, default_mode);
            let reason = t.reason.clone().unwrap_or_else(|| "work failed".into());
            for e in monitor::recovery_plan(&scratch, &t.id, mode, &reason)? {
                push(&mut scratch, &mut events, e)?;
            }
            recovered.push(t.id.clone());
        }
    }

    // Pending tasks that can never be offered.
    loop {
        let blocked: Option<EventKind> = scratch.tasks.iter().find_map(|t| {
            if t.status != TaskStatus::Pending {
                return None;
            }
            if let Some(dep) = t.depends_on.iter().find(|d| {
                scratch
                    .tasks
                    .iter()
                    .any(|u| &u.id == *d && u.status == TaskStatus::Failed && u.exhausted)
            }) {
                return Some(EventKind::Exhausted {
                    task: t.id.clone(),
                    reason: format!("blocked by dependency '{dep}'"),
                });
            }
            let debug = t.replay == Some(ReplayMode::Debug);
            if !debug && !scratch.budget_left(t) {
                return Some(EventKind::Exhausted {
                    task: t.id.clone(),
                    reason: format!("no attempts left after {}", t.attempts),
                });
            }
            None
        });
        match blocked {
            Some(e) => push(&mut scratch, &mut events, e)?,
            None => break,
        }
    }

    if let Some(e) = final_status(&scratch) {
        push(&mut scratch, &mut events, e)?;
    }
    Ok(events)
}

fn resolve_decline(ledger: &Ledger, t: &Task) -> Vec<EventKind> {
    let Some(response) = &t.last_response else {
        return Vec::new();
    };
    let revert = |reason: String| EventKind::Reverted {
        task: t.id.clone(),
        reason,
        replay: t.replay,
        keep_output: true,
        charged: false,
    };
    match consent::decide(&t.id, response, ledger.budget_left(t)) {
        Decision::Proceed => Vec::new(),
        Decision::Reassign { note } => {
            let mut events = Vec::new();
            if let Some(text) = note {
                events.push(EventKind::Noted {
                    task: Some(t.id.clone()),
                    text,
                });
            }
            events.push(revert(format!("{}; reassigning", response.label())));
            events
        }
        Decision::Clarify { question } => vec![
            EventKind::Noted {
                task: Some(t.id.clone()),
                text: clarification(ledger, t, &question),
            },
            revert(format!("clarification requested: {question}")),
        ],
        Decision::Fail { reason } => vec![EventKind::Exhausted {
            task: t.id.clone(),
            reason,
        }],
    }
}

/// Answer to a REQUEST_CLARIFICATION, built from what the ledger knows.
fn clarification(ledger: &Ledger, t: &Task, question: &str) -> String {
    let inputs = ledger
        .dependency_outputs(t)
        .into_iter()
        .map(|(id, _)| id)
        .collect::<Vec<_>>();
    let inputs = if inputs.is_empty() {
        "none".to_string()
    } else {
        inputs.join(", ")
    };
    format!(
        "Clarification for {} (asked: {question}). Task: {}. Part of: {}. Inputs available: {inputs}.",
        t.id, t.description, ledger.ceremony.master_task
    )
}

/// The ceremony's end state once every task is settled.
fn final_status(ledger: &Ledger) -> Option<EventKind> {
    if !ledger.is_settled() {
        return None;
    }
    let failed: Vec<&Task> = ledger
        .tasks
        .iter()
        .filter(|t| t.status != TaskStatus::Complete)
        .collect();
    let (status, reason) = if failed.is_empty() {
        (CeremonyStatus::Complete, None)
    } else if failed.iter().any(|t| t.required) {
        let ids: Vec<&str> = failed.iter().filter(|t| t.required).map(|t| t.id.as_str()).collect();
        (
            CeremonyStatus::Abandoned,
            Some(format!("required task(s) failed: {}", ids.join(", "))),
        )
    } else {
        let ids: Vec<&str> = failed.iter().map(|t| t.id.as_str()).collect();
        (
            CeremonyStatus::Degraded,
            Some(format!("optional task(s) failed: {}", ids.join(", "))),
        )
    };
    Some(EventKind::StatusChanged { status, reason })
}

/// Invitations for every ready task.
fn offers(ledger: &Ledger) -> Vec<Invitation> {
    if ledger.status() != CeremonyStatus::Active {
        return Vec::new();
    }
    task::ready_tasks(&ledger.tasks)
        .into_iter()
        .filter(|t| t.replay == Some(ReplayMode::Debug) || ledger.budget_left(t))
        .map(|t| {
            let attempt = if t.replay == Some(ReplayMode::Debug) {
                t.attempts.max(1)
            } else {
                t.attempts + 1
            };
            Invitation {
                ceremony_id: ledger.id().to_string(),
                task_id: t.id.clone(),
                worker_id: transport::new_worker_id(&t.id, attempt),
                description: t.description.clone(),
                expected_benefit: expected_benefit(ledger, t),
                attempt,
                replay: t.replay,
                resume_from: match (&t.output, t.output_partial) {
                    (Some(out), true) => Some(out.clone()),
                    _ => None,
                },
            }
        })
        .collect()
}

fn expected_benefit(ledger: &Ledger, t: &Task) -> String {
    let unblocks: Vec<&str> = task::direct_dependents(&ledger.tasks, &t.id)
        .into_iter()
        .map(|d| d.id.as_str())
        .collect();
    let credit = format!("your output is credited as section '{}' of the final synthesis", t.id);
    if unblocks.is_empty() {
        credit
    } else {
        format!("unblocks {}; {credit}", unblocks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::Response;
    use crate::task::{TaskGraph, TaskSpec};

    fn ledger(max_attempts: u32) -> Ledger {
        let graph = TaskGraph::new(vec![
            TaskSpec::new("A", "research"),
            TaskSpec::new("B", "write").depends_on(["A"]),
        ]);
        Ledger::begin("c1", "an article", &graph, max_attempts, 5, Utc::now()).unwrap()
    }

    fn offer_and_respond(l: &mut Ledger, id: &str, response: Response) {
        let inv = offers(l).into_iter().find(|i| i.task_id == id).unwrap();
        let worker = inv.worker_id.clone();
        l.record(EventKind::Invited { invitation: inv }).unwrap();
        l.record(EventKind::Responded {
            task: id.into(),
            worker,
            response,
        })
        .unwrap();
    }

    fn apply_all(l: &mut Ledger, events: Vec<EventKind>) {
        for e in events {
            l.record(e).unwrap();
        }
    }

    fn resolve_now(l: &Ledger) -> Vec<EventKind> {
        resolve(
            l,
            &HashSet::new(),
            chrono::Duration::seconds(60),
            ReplayMode::Resume,
            &mut Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn offers_only_ready_tasks_with_benefit() {
        let l = ledger(3);
        let invs = offers(&l);
        assert_eq!(invs.len(), 1);
        assert_eq!(invs[0].task_id, "A");
        assert_eq!(invs[0].attempt, 1);
        assert!(invs[0].expected_benefit.contains("unblocks B"));
    }

    #[test]
    fn clarification_request_is_answered_then_reoffered() {
        let mut l = ledger(3);
        offer_and_respond(
            &mut l,
            "A",
            Response::RequestClarification {
                text: "which sources?".into(),
            },
        );
        let events = resolve_now(&l);
        apply_all(&mut l, events);
        assert_eq!(l.task("A").unwrap().status, TaskStatus::Pending);
        assert!(l.shared_context_text().contains("which sources?"));
        assert!(l.shared_context_text().contains("an article"));
        assert_eq!(l.ceremony.retries_used, 0);
    }

    #[test]
    fn decline_without_budget_fails_and_blocks_dependents() {
        let mut l = ledger(1);
        offer_and_respond(
            &mut l,
            "A",
            Response::Decline {
                reason: "no time".into(),
            },
        );
        let events = resolve_now(&l);
        apply_all(&mut l, events);
        let a = l.task("A").unwrap();
        assert!(a.exhausted);
        assert!(a.reason.as_deref().unwrap().contains("no time"));
        let b = l.task("B").unwrap();
        assert_eq!(b.status, TaskStatus::Failed);
        assert!(b.reason.as_deref().unwrap().contains("blocked by dependency 'A'"));
        assert_eq!(l.status(), CeremonyStatus::Abandoned);
    }

    #[test]
    fn resolve_is_empty_when_nothing_changed() {
        let mut l = ledger(3);
        offer_and_respond(&mut l, "A", Response::Accept);
        assert!(resolve_now(&l).is_empty());
        assert!(offers(&l).is_empty());
    }

    #[test]
    fn optional_failure_degrades() {
        let graph = TaskGraph::new(vec![
            TaskSpec::new("A", "core"),
            TaskSpec::new("B", "extra").optional(),
        ]);
        let mut l = Ledger::begin("c1", "m", &graph, 1, 5, Utc::now()).unwrap();
        offer_and_respond(&mut l, "A", Response::Accept);
        let worker = l.task("A").unwrap().assignee.clone().unwrap();
        apply_all(
            &mut l,
            vec![
                EventKind::Started {
                    task: "A".into(),
                    worker: worker.clone(),
                },
                EventKind::Completed {
                    task: "A".into(),
                    worker,
                    output: "done".into(),
                },
                EventKind::Exhausted {
                    task: "B".into(),
                    reason: "nobody".into(),
                },
            ],
        );
        let events = resolve_now(&l);
        apply_all(&mut l, events);
        assert_eq!(l.status(), CeremonyStatus::Degraded);
    }
}
