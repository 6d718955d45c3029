use crate::consent::{Invitation, Response};
use crate::task::TaskSpec;
use crate::types::{CeremonyStatus, ReplayMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: EventKind,
}

/// Every ledger mutation is one of these. Applying them in order from
/// `Begun` reproduces the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Begun {
        master_task: String,
        max_attempts: u32,
        retry_budget: u32,
        tasks: Vec<TaskSpec>,
    },
    Invited {
        invitation: Invitation,
    },
    Responded {
        task: String,
        worker: String,
        response: Response,
    },
    Started {
        task: String,
        worker: String,
    },
    Heartbeat {
        task: String,
        worker: String,
    },
    Checkpointed {
        task: String,
        worker: String,
        partial_output: String,
    },
    Completed {
        task: String,
        worker: String,
        output: String,
    },
    WorkFailed {
        task: String,
        worker: String,
        reason: String,
    },
    /// Back to PENDING for another offer.
    Reverted {
        task: String,
        reason: String,
        #[serde(default)]
        replay: Option<ReplayMode>,
        #[serde(default)]
        keep_output: bool,
        /// Counts against the ceremony-wide retry budget.
        #[serde(default)]
        charged: bool,
    },
    /// Reset because an upstream task is being replayed.
    Superseded {
        task: String,
        cause: String,
    },
    /// FAILED with no retries left.
    Exhausted {
        task: String,
        reason: String,
    },
    Noted {
        #[serde(default)]
        task: Option<String>,
        text: String,
    },
    StatusChanged {
        status: CeremonyStatus,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl EventKind {
    /// Task the event is about, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            EventKind::Invited { invitation } => Some(&invitation.task_id),
            EventKind::Responded { task, .. }
            | EventKind::Started { task, .. }
            | EventKind::Heartbeat { task, .. }
            | EventKind::Checkpointed { task, .. }
            | EventKind::Completed { task, .. }
            | EventKind::WorkFailed { task, .. }
            | EventKind::Reverted { task, .. }
            | EventKind::Superseded { task, .. }
            | EventKind::Exhausted { task, .. } => Some(task),
            EventKind::Noted { task, .. } => task.as_deref(),
            EventKind::Begun { .. } | EventKind::StatusChanged { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Begun { .. } => "begun",
            EventKind::Invited { .. } => "invited",
            EventKind::Responded { .. } => "responded",
            EventKind::Started { .. } => "started",
            EventKind::Heartbeat { .. } => "heartbeat",
            EventKind::Checkpointed { .. } => "checkpointed",
            EventKind::Completed { .. } => "completed",
            EventKind::WorkFailed { .. } => "work_failed",
            EventKind::Reverted { .. } => "reverted",
            EventKind::Superseded { .. } => "superseded",
            EventKind::Exhausted { .. } => "exhausted",
            EventKind::Noted { .. } => "noted",
            EventKind::StatusChanged { .. } => "status_changed",
        }
    }
}
