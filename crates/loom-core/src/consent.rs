//! Invitation / Response: the consent step every worker goes through before
//! any work happens.
//!
//! The orchestrator never infers consent. A task reaches IN_PROGRESS only
//! after its worker recorded an explicit [`Response::Accept`]; every other
//! response (or no response at all) is routed through [`decide`].

use crate::error::{LoomError, Result};
use crate::ledger::Ledger;
use crate::types::ReplayMode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Invitation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub ceremony_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub description: String,
    /// What taking the task earns the worker.
    pub expected_benefit: String,
    pub attempt: u32,
    #[serde(default)]
    pub replay: Option<ReplayMode>,
    /// Partial output of the previous attempt when resuming.
    #[serde(default)]
    pub resume_from: Option<String>,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    Accept,
    Decline { reason: String },
    ProposeAlternative { text: String },
    RequestClarification { text: String },
}

impl Response {
    pub fn is_accept(&self) -> bool {
        matches!(self, Response::Accept)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Response::Accept => "ACCEPT",
            Response::Decline { .. } => "DECLINE",
            Response::ProposeAlternative { .. } => "PROPOSE_ALTERNATIVE",
            Response::RequestClarification { .. } => "REQUEST_CLARIFICATION",
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// What the orchestrator does with a recorded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The worker accepted; it may start work.
    Proceed,
    /// Offer the task again, optionally leaving a note in Shared Context.
    Reassign { note: Option<String> },
    /// Answer the worker's question in Shared Context, then offer again.
    Clarify { question: String },
    /// Settle the task as FAILED.
    Fail { reason: String },
}

/// Only an explicit ACCEPT lets a task start.
pub fn may_start(response: Option<&Response>) -> bool {
    matches!(response, Some(Response::Accept))
}

/// Resolve a non-acceptance. `budget_left` is whether another invitation
/// may still be issued for the task.
pub fn decide(task_id: &str, response: &Response, budget_left: bool) -> Decision {
    if !budget_left {
        let reason = match response {
            Response::Accept => return Decision::Proceed,
            Response::Decline { reason } => reason.clone(),
            Response::ProposeAlternative { text } => {
                format!("only an alternative was offered: {text}")
            }
            Response::RequestClarification { text } => {
                format!("clarification still outstanding: {text}")
            }
        };
        let err = LoomError::TaskDeclined {
            task: task_id.to_string(),
            reason,
        };
        return Decision::Fail {
            reason: err.to_string(),
        };
    }
    match response {
        Response::Accept => Decision::Proceed,
        Response::Decline { .. } => Decision::Reassign { note: None },
        Response::ProposeAlternative { text } => Decision::Reassign {
            note: Some(format!("Alternative proposed for {task_id}: {text}")),
        },
        Response::RequestClarification { text } => Decision::Clarify {
            question: text.clone(),
        },
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// The worker-side half of the negotiation.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, invitation: &Invitation, ledger: &Ledger) -> Result<Response>;
}

/// Accepts every invitation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl Responder for AcceptAll {
    async fn respond(&self, _invitation: &Invitation, _ledger: &Ledger) -> Result<Response> {
        Ok(Response::Accept)
    }
}

#[async_trait]
impl<F> Responder for F
where
    F: Fn(&Invitation) -> Response + Send + Sync,
{
    async fn respond(&self, invitation: &Invitation, _ledger: &Ledger) -> Result<Response> {
        Ok(self(invitation))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
