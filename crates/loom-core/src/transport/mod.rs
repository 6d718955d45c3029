//! How a worker gets a place to run.
//!
//! The orchestrator only ever sees [`Transport`]; nothing in ceremony logic
//! branches on which implementation is configured.
//!
//! | | isolated | lightweight |
//! |---|---|---|
//! | substrate | OS process (optionally inside a sandbox launcher) | tokio task in the coordinator |
//! | ledger access | opens the ledger file itself | shares the coordinator's store |
//! | terminate | kill, guaranteed | cancellation flag, checked at await points and checkpoints |

pub mod isolated;
pub mod lightweight;

pub use isolated::IsolatedTransport;
pub use lightweight::LightweightTransport;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::TransportKind;

/// What a worker is launched with: `(ceremony_id, task_id, ledger_location)`
/// plus the worker identity the task is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub ceremony_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub ledger: PathBuf,
    /// DEBUG replay: verbose instrumentation.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub ceremony_id: String,
    pub task_id: String,
    pub kind: TransportKind,
    #[serde(default)]
    pub pid: Option<u32>,
    pub spawned_at: DateTime<Utc>,
}

impl WorkerHandle {
    pub(crate) fn for_spec(spec: &WorkerSpec, kind: TransportKind, pid: Option<u32>) -> Self {
        Self {
            worker_id: spec.worker_id.clone(),
            ceremony_id: spec.ceremony_id.clone(),
            task_id: spec.task_id.clone(),
            kind,
            pid,
            spawned_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerHandle>;

    async fn is_alive(&self, handle: &WorkerHandle) -> bool;

    /// Stop the worker. Unknown or already-finished handles are a no-op.
    async fn terminate(&self, handle: &WorkerHandle) -> Result<()>;
}

/// `<task>-<attempt>-<8 hex>`, unique per invitation.
pub fn new_worker_id(task_id: &str, attempt: u32) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{task_id}-{attempt}-{}", &uuid[..8])
}
