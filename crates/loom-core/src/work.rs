//! The work function seam and the checkpoint handle a worker hands to it.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{LoomError, Result};
use crate::ledger::{update, EventKind, Ledger, LedgerStore, RetryPolicy};

/// Everything a work function sees about its task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkContext {
    pub ceremony_id: String,
    pub master_task: String,
    pub task_id: String,
    pub description: String,
    pub attempt: u32,
    /// Shared Context notes, one per line.
    pub shared_context: String,
    /// `(task id, output)` for every dependency.
    pub dependency_outputs: Vec<(String, String)>,
    /// Partial output of a stalled earlier attempt.
    pub resume_from: Option<String>,
    /// DEBUG replay.
    pub debug: bool,
}

impl WorkContext {
    pub fn from_ledger(ledger: &Ledger, task_id: &str, debug: bool) -> Result<Self> {
        let task = ledger.task(task_id)?;
        let resume_from = match (&task.output, task.output_partial) {
            (Some(out), true) => Some(out.clone()),
            _ => None,
        };
        Ok(Self {
            ceremony_id: ledger.id().to_string(),
            master_task: ledger.ceremony.master_task.clone(),
            task_id: task.id.clone(),
            description: task.description.clone(),
            attempt: task.attempts,
            shared_context: ledger.shared_context_text(),
            dependency_outputs: ledger.dependency_outputs(task),
            resume_from,
            debug,
        })
    }
}

// ---------------------------------------------------------------------------
// Checkpointer
// ---------------------------------------------------------------------------

/// Writes partial output and heartbeats for one (task, worker) binding.
/// Every write is fenced on the assignee, so a superseded worker gets
/// [`LoomError::StaleWorker`] back.
#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn LedgerStore>,
    policy: RetryPolicy,
    ceremony_id: String,
    task_id: String,
    worker_id: String,
    cancel: watch::Receiver<bool>,
}

impl Checkpointer {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        policy: RetryPolicy,
        ceremony_id: &str,
        task_id: &str,
        worker_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            policy,
            ceremony_id: ceremony_id.to_string(),
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Record partial output. Also the cooperative cancellation point.
    pub async fn checkpoint(&self, partial_output: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(LoomError::Cancelled);
        }
        self.append(EventKind::Checkpointed {
            task: self.task_id.clone(),
            worker: self.worker_id.clone(),
            partial_output: partial_output.to_string(),
        })
        .await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(LoomError::Cancelled);
        }
        self.append(EventKind::Heartbeat {
            task: self.task_id.clone(),
            worker: self.worker_id.clone(),
        })
        .await
    }

    async fn append(&self, event: EventKind) -> Result<()> {
        update(&self.store, &self.ceremony_id, &self.policy, move |ledger| {
            ledger.record(event.clone())
        })
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WorkFn
// ---------------------------------------------------------------------------

/// Performs the task. Opaque to the orchestrator.
#[async_trait]
pub trait WorkFn: Send + Sync {
    async fn run(&self, ctx: WorkContext, checkpoint: Checkpointer) -> Result<String>;
}

#[async_trait]
impl<F, Fut> WorkFn for F
where
    F: Fn(WorkContext, Checkpointer) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn run(&self, ctx: WorkContext, checkpoint: Checkpointer) -> Result<String> {
        self(ctx, checkpoint).await
    }
}

/// Fails every task. Stands in when no work command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWork;

#[async_trait]
impl WorkFn for NoWork {
    async fn run(&self, ctx: WorkContext, _checkpoint: Checkpointer) -> Result<String> {
        Err(LoomError::WorkFailed(format!(
            "no work command configured for task '{}'",
            ctx.task_id
        )))
    }
}
