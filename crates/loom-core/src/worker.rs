//! The worker side of a ceremony: one task, one binding, then exit.
//!
//! Order of operations is fixed: read the invitation from the ledger,
//! record a response, and only after a recorded ACCEPT mark the task
//! started and run the work function. Heartbeats are written on an
//! interval while the work function runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::consent::{Invitation, Responder, Response};
use crate::error::{LoomError, Result};
use crate::ledger::{blocking, update, EventKind, Ledger, LedgerStore, RetryPolicy};
use crate::transport::WorkerSpec;
use crate::types::TaskStatus;
use crate::work::{Checkpointer, WorkContext, WorkFn};
use tokio::sync::watch;

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Failed(String),
    /// Recorded a non-ACCEPT response; no work done.
    Responded(String),
    Cancelled,
    /// The task was reassigned away from this worker.
    Superseded,
}

pub struct Worker {
    store: Arc<dyn LedgerStore>,
    work: Arc<dyn WorkFn>,
    responder: Arc<dyn Responder>,
    heartbeat_interval: Duration,
    policy: RetryPolicy,
}

impl Worker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        work: Arc<dyn WorkFn>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        Self {
            store,
            work,
            responder,
            heartbeat_interval: Duration::from_secs(5),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run the worker for `spec`. Losing the binding is not an error: the
    /// worker stops and reports [`WorkerOutcome::Superseded`].
    pub async fn run(&self, spec: &WorkerSpec, cancel: watch::Receiver<bool>) -> Result<WorkerOutcome> {
        match self.run_inner(spec, cancel).await {
            Err(LoomError::StaleWorker { .. }) => {
                tracing::info!(
                    task = %spec.task_id,
                    worker = %spec.worker_id,
                    "task reassigned, worker exiting"
                );
                Ok(WorkerOutcome::Superseded)
            }
            Err(LoomError::Cancelled) => Ok(WorkerOutcome::Cancelled),
            other => other,
        }
    }

    async fn run_inner(&self, spec: &WorkerSpec, mut cancel: watch::Receiver<bool>) -> Result<WorkerOutcome> {
        let ledger = self.read(spec).await?;
        let invitation = pending_invitation(&ledger, spec)?;
        if spec.debug {
            tracing::info!(
                task = %spec.task_id,
                worker = %spec.worker_id,
                attempt = invitation.attempt,
                "debug replay: invitation received"
            );
        }
        let checkpointer = Checkpointer::new(
            Arc::clone(&self.store),
            self.policy,
            &spec.ceremony_id,
            &spec.task_id,
            &spec.worker_id,
            cancel.clone(),
        );

        // A slow responder keeps the OFFERED task alive.
        let responded = self.heartbeating(
            self.responder.respond(&invitation, &ledger),
            &checkpointer,
            &mut cancel,
        );
        let response = match responded.await? {
            Ok(r) => r,
            Err(e) => Response::Decline {
                reason: format!("responder failed: {e}"),
            },
        };
        let label = response.label();
        let accepted = response.is_accept();
        self.append(
            spec,
            EventKind::Responded {
                task: spec.task_id.clone(),
                worker: spec.worker_id.clone(),
                response,
            },
        )
        .await?;
        tracing::debug!(task = %spec.task_id, worker = %spec.worker_id, response = label, "response recorded");
        if !accepted {
            return Ok(WorkerOutcome::Responded(label.to_string()));
        }

        self.append(
            spec,
            EventKind::Started {
                task: spec.task_id.clone(),
                worker: spec.worker_id.clone(),
            },
        )
        .await?;

        let ledger = self.read(spec).await?;
        let ctx = WorkContext::from_ledger(&ledger, &spec.task_id, spec.debug)?;
        let work = self.work.run(ctx, checkpointer.clone());
        let result = self.heartbeating(work, &checkpointer, &mut cancel).await?;

        match result {
            Ok(output) => {
                if spec.debug {
                    tracing::info!(
                        task = %spec.task_id,
                        bytes = output.len(),
                        "debug replay: work returned"
                    );
                }
                self.append(
                    spec,
                    EventKind::Completed {
                        task: spec.task_id.clone(),
                        worker: spec.worker_id.clone(),
                        output,
                    },
                )
                .await?;
                tracing::info!(task = %spec.task_id, worker = %spec.worker_id, "task complete");
                Ok(WorkerOutcome::Completed)
            }
            Err(e @ (LoomError::StaleWorker { .. } | LoomError::Cancelled)) => Err(e),
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(task = %spec.task_id, worker = %spec.worker_id, error = %reason, "work failed");
                self.append(
                    spec,
                    EventKind::WorkFailed {
                        task: spec.task_id.clone(),
                        worker: spec.worker_id.clone(),
                        reason: reason.clone(),
                    },
                )
                .await?;
                Ok(WorkerOutcome::Failed(reason))
            }
        }
    }

    /// Drive `fut` to completion, writing a heartbeat every interval and
    /// stopping early on cancellation.
    async fn heartbeating<T>(
        &self,
        fut: impl Future<Output = T>,
        checkpointer: &Checkpointer,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<T> {
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.tick().await;
        let mut cancel_open = true;
        loop {
            tokio::select! {
                r = &mut fut => return Ok(r),
                _ = ticker.tick() => checkpointer.heartbeat().await?,
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel.borrow() => return Err(LoomError::Cancelled),
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                },
            }
        }
    }

    async fn read(&self, spec: &WorkerSpec) -> Result<Ledger> {
        let id = spec.ceremony_id.clone();
        let (ledger, _) = blocking(&self.store, move |store| store.read(&id)).await?;
        Ok(ledger)
    }

    async fn append(&self, spec: &WorkerSpec, event: EventKind) -> Result<u64> {
        update(&self.store, &spec.ceremony_id, &self.policy, move |ledger| {
            ledger.record(event.clone())
        })
        .await
    }
}

/// The invitation this worker was spawned for. The task must still be
/// OFFERED to `spec.worker_id`.
fn pending_invitation(ledger: &Ledger, spec: &WorkerSpec) -> Result<Invitation> {
    let task = ledger.task(&spec.task_id)?;
    if !task.is_held_by(&spec.worker_id) || task.status != TaskStatus::Offered {
        return Err(LoomError::StaleWorker {
            task: spec.task_id.clone(),
            worker: spec.worker_id.clone(),
        });
    }
    ledger
        .events
        .iter()
        .rev()
        .find_map(|e| match &e.event {
            EventKind::Invited { invitation } if invitation.worker_id == spec.worker_id => {
                Some(invitation.clone())
            }
            _ => None,
        })
        .ok_or_else(|| LoomError::Store(format!("no invitation recorded for worker '{}'", spec.worker_id)))
}
