//! One OS process per worker.
//!
//! The worker command line is
//!
//! ```text
//! [wrapper...] <program> [args...] worker --ceremony <id> --task <id> \
//!     --worker-id <id> --ledger <path> [--debug]
//! ```
//!
//! where `wrapper` is an optional sandbox launcher (a container runtime
//! invocation, `bwrap`, `firejail`...). The tail of each worker's stderr is
//! kept so a worker that dies early can be diagnosed from the coordinator
//! log.
//!
//! Workers outlive the transport: a one-shot `loom advance` spawns them and
//! exits, and a later `advance` finds them through the ledger alone.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::{Transport, WorkerHandle, WorkerSpec};
use crate::error::{LoomError, Result};
use crate::types::TransportKind;

/// Stderr kept per worker, newest bytes win.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

struct LiveWorker {
    child: Child,
    stderr_buf: Arc<Mutex<String>>,
}

pub struct IsolatedTransport {
    program: PathBuf,
    args: Vec<String>,
    wrapper: Vec<String>,
    live: tokio::sync::Mutex<HashMap<String, LiveWorker>>,
}

impl IsolatedTransport {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            wrapper: Vec::new(),
            live: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Arguments placed before the `worker` subcommand.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Sandbox launcher prepended to the command line.
    pub fn with_wrapper(mut self, wrapper: Vec<String>) -> Self {
        self.wrapper = wrapper;
        self
    }

    pub(crate) fn command_line(&self, spec: &WorkerSpec) -> Vec<String> {
        let mut argv: Vec<String> = self.wrapper.clone();
        argv.push(self.program.to_string_lossy().into_owned());
        argv.extend(self.args.iter().cloned());
        argv.extend([
            "worker".to_string(),
            "--ceremony".to_string(),
            spec.ceremony_id.clone(),
            "--task".to_string(),
            spec.task_id.clone(),
            "--worker-id".to_string(),
            spec.worker_id.clone(),
            "--ledger".to_string(),
            spec.ledger.to_string_lossy().into_owned(),
        ]);
        if spec.debug {
            argv.push("--debug".to_string());
        }
        argv
    }
}

/// Append a stderr line, dropping whole lines from the front once the
/// buffer passes [`STDERR_TAIL_BYTES`].
fn push_tail(buf: &mut String, line: &str) {
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
    if buf.len() <= STDERR_TAIL_BYTES {
        return;
    }
    let mut cut = buf.len() - STDERR_TAIL_BYTES;
    while !buf.is_char_boundary(cut) {
        cut += 1;
    }
    if let Some(nl) = buf[cut..].find('\n') {
        cut += nl + 1;
    }
    buf.drain(..cut);
}

#[async_trait]
impl Transport for IsolatedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Isolated
    }

    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerHandle> {
        let argv = self.command_line(&spec);
        let (program, rest) = argv.split_first().ok_or_else(|| LoomError::WorkerSpawn {
            task: spec.task_id.clone(),
            reason: "empty worker command line".into(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| LoomError::WorkerSpawn {
            task: spec.task_id.clone(),
            reason: format!("{program}: {e}"),
        })?;

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Ok(mut b) = buf.lock() {
                        push_tail(&mut b, &line);
                    }
                }
            });
        }

        let handle = WorkerHandle::for_spec(&spec, TransportKind::Isolated, child.id());
        tracing::debug!(
            ceremony = %spec.ceremony_id,
            task = %spec.task_id,
            worker = %spec.worker_id,
            pid = ?handle.pid,
            "spawned isolated worker"
        );
        self.live
            .lock()
            .await
            .insert(spec.worker_id, LiveWorker { child, stderr_buf });
        Ok(handle)
    }

    async fn is_alive(&self, handle: &WorkerHandle) -> bool {
        let mut live = self.live.lock().await;
        let Some(w) = live.get_mut(&handle.worker_id) else {
            return false;
        };
        match w.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                if !status.success() {
                    let stderr = w.stderr_buf.lock().map(|b| b.clone()).unwrap_or_default();
                    tracing::warn!(
                        task = %handle.task_id,
                        worker = %handle.worker_id,
                        %status,
                        stderr = %stderr,
                        "isolated worker exited abnormally"
                    );
                }
                live.remove(&handle.worker_id);
                false
            }
            Err(e) => {
                tracing::warn!(worker = %handle.worker_id, error = %e, "failed to poll worker");
                false
            }
        }
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<()> {
        let Some(mut w) = self.live.lock().await.remove(&handle.worker_id) else {
            return Ok(());
        };
        if let Ok(None) = w.child.try_wait() {
            w.child.kill().await?;
            tracing::info!(
                task = %handle.task_id,
                worker = %handle.worker_id,
                "terminated isolated worker"
            );
        }
        Ok(())
    }
}
