use crate::synthesis::Synthesis;
use crate::types::{CeremonyStatus, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoomError {
    #[error("not initialized: run 'loom init'")]
    NotInitialized,

    #[error("decomposition failed: {0}")]
    Decomposition(String),

    #[error("revision conflict: expected {expected}, ledger is at {actual}")]
    RevisionConflict { expected: u64, actual: u64 },

    #[error("failed to spawn worker for task '{task}': {reason}")]
    WorkerSpawn { task: String, reason: String },

    #[error("worker '{worker}' on task '{task}' missed its heartbeat ({elapsed_secs}s since last)")]
    WorkerTimeout {
        task: String,
        worker: String,
        elapsed_secs: i64,
    },

    #[error("task '{task}' declined: {reason}")]
    TaskDeclined { task: String, reason: String },

    #[error("ceremony '{id}' is {status}, synthesis requires a finished ceremony")]
    IncompleteCeremony { id: String, status: CeremonyStatus },

    #[error("ceremony '{}' abandoned with {} failed task(s)", .partial.ceremony_id, .partial.gaps.len())]
    CeremonyAbandoned { partial: Box<Synthesis> },

    #[error("ceremony not found: {0}")]
    CeremonyNotFound(String),

    #[error("ceremony already exists: {0}")]
    CeremonyExists(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid transition for task '{task}' from {from} to {to}: {reason}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
        reason: String,
    },

    #[error("invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("invalid id '{0}': must be alphanumeric with '-', '_' or '.'")]
    InvalidId(String),

    #[error("unknown replay mode '{0}' (expected resume, restart, selective or debug)")]
    InvalidReplayMode(String),

    #[error("worker '{worker}' no longer holds task '{task}'")]
    StaleWorker { task: String, worker: String },

    #[error("worker cancelled")]
    Cancelled,

    #[error("timed out waiting for ledger lock {0}")]
    LockTimeout(String),

    #[error("ledger store error: {0}")]
    Store(String),

    #[error("work failed: {0}")]
    WorkFailed(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LoomError {
    /// Errors worth retrying close to their source.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LoomError::RevisionConflict { .. }
                | LoomError::WorkerSpawn { .. }
                | LoomError::LockTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;
