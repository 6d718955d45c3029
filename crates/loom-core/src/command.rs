//! External collaborators as subprocesses speaking JSON.
//!
//! # Protocol
//! - decomposer: stdin `{"master_task": "..."}`, stdout a task graph
//!   `{"tasks": [{"id", "description", "depends_on", "required"}]}`.
//! - responder: stdin an Invitation, stdout a Response
//!   (`{"type": "ACCEPT"}`, `{"type": "DECLINE", "reason": "..."}`, ...).
//! - work: stdin a WorkContext, stdout JSON lines, one of
//!   `{"type": "checkpoint", "partial_output": "..."}`,
//!   `{"type": "output", "output": "..."}`,
//!   `{"type": "error", "reason": "..."}`.
//!
//! Stderr passes through so collaborator logs land next to ours. Every
//! child is killed when its future is dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use crate::config::CommandConfig;
use crate::consent::{Invitation, Responder, Response};
use crate::decompose::Decomposer;
use crate::error::{LoomError, Result};
use crate::ledger::Ledger;
use crate::task::TaskGraph;
use crate::work::{Checkpointer, WorkContext, WorkFn};

/// A configured command, run from `root` with `LOOM_ROOT` set.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    config: CommandConfig,
    root: PathBuf,
}

impl ExternalCommand {
    pub fn new(config: CommandConfig, root: &Path) -> Self {
        Self {
            config,
            root: root.to_path_buf(),
        }
    }

    fn spawn(&self, input: &impl Serialize) -> Result<(Child, Vec<u8>)> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env("LOOM_ROOT", &self.root)
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| LoomError::Command(format!("{}: {e}", self.config.command)))?;
        let mut payload = serde_json::to_vec(input)?;
        payload.push(b'\n');
        Ok((child, payload))
    }

    async fn feed(child: &mut Child, payload: &[u8]) -> Result<()> {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload)
                .await
                .map_err(|e| LoomError::Command(format!("failed to write stdin: {e}")))?;
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.timeout_secs.map(Duration::from_secs)
    }

    /// Send one JSON document, read one back.
    pub async fn call<I: Serialize, O: DeserializeOwned>(&self, input: &I) -> Result<O> {
        let (mut child, payload) = self.spawn(input)?;
        Self::feed(&mut child, &payload).await?;
        let wait = child.wait_with_output();
        let output = match self.timeout() {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                LoomError::Command(format!(
                    "{} timed out after {}s",
                    self.config.command,
                    limit.as_secs()
                ))
            })??,
            None => wait.await?,
        };
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let hint = stdout.chars().take(500).collect::<String>();
            return Err(LoomError::Command(format!(
                "{} exited with {}: {hint}",
                self.config.command, output.status
            )));
        }
        serde_json::from_str(stdout.trim()).map_err(|e| {
            LoomError::Command(format!("{} wrote invalid JSON: {e}", self.config.command))
        })
    }
}

// ---------------------------------------------------------------------------
// Decomposer
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct DecomposeRequest<'a> {
    master_task: &'a str,
}

pub struct CommandDecomposer(pub ExternalCommand);

#[async_trait]
impl Decomposer for CommandDecomposer {
    async fn decompose(&self, master_task: &str) -> Result<TaskGraph> {
        self.0
            .call(&DecomposeRequest { master_task })
            .await
            .map_err(|e| LoomError::Decomposition(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

pub struct CommandResponder(pub ExternalCommand);

#[async_trait]
impl Responder for CommandResponder {
    async fn respond(&self, invitation: &Invitation, _ledger: &Ledger) -> Result<Response> {
        self.0.call(invitation).await
    }
}

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkLine {
    Checkpoint { partial_output: String },
    Output { output: String },
    Error { reason: String },
}

pub struct CommandWork(pub ExternalCommand);

impl CommandWork {
    async fn stream(&self, ctx: &WorkContext, checkpoint: &Checkpointer) -> Result<String> {
        let cmd = &self.0;
        let (mut child, payload) = cmd.spawn(ctx)?;
        ExternalCommand::feed(&mut child, &payload).await?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LoomError::Command("stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut output = None;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkLine>(line) {
                Ok(WorkLine::Checkpoint { partial_output }) => checkpoint.checkpoint(&partial_output).await?,
                Ok(WorkLine::Output { output: o }) => output = Some(o),
                Ok(WorkLine::Error { reason }) => return Err(LoomError::WorkFailed(reason)),
                Err(e) => {
                    tracing::debug!(line, error = %e, "skipping unrecognised work output line");
                }
            }
        }
        let status = child.wait().await?;
        match output {
            Some(o) if status.success() => Ok(o),
            Some(_) => Err(LoomError::WorkFailed(format!(
                "{} exited with {status} after writing output",
                cmd.config.command
            ))),
            None => Err(LoomError::WorkFailed(format!(
                "{} exited with {status} without an output line",
                cmd.config.command
            ))),
        }
    }
}

#[async_trait]
impl WorkFn for CommandWork {
    async fn run(&self, ctx: WorkContext, checkpoint: Checkpointer) -> Result<String> {
        let task = ctx.task_id.clone();
        let fut = self.stream(&ctx, &checkpoint);
        match self.0.timeout() {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                LoomError::WorkFailed(format!("task '{task}' timed out after {}s", limit.as_secs()))
            })?,
            None => fut.await,
        }
    }
}
