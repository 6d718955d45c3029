//! Workers as tokio tasks inside the coordinator.
//!
//! Startup costs one task spawn. The worker shares the coordinator's ledger
//! store, so a write from the worker wakes the run loop through the store's
//! change notifications. Termination is cooperative: a watch flag the
//! worker checks at every await point and every checkpoint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Transport, WorkerHandle, WorkerSpec};
use crate::error::Result;
use crate::types::TransportKind;
use crate::worker::{Worker, WorkerOutcome};

struct LiveTask {
    join: JoinHandle<Result<WorkerOutcome>>,
    cancel: watch::Sender<bool>,
}

pub struct LightweightTransport {
    worker: Arc<Worker>,
    live: tokio::sync::Mutex<HashMap<String, LiveTask>>,
}

impl LightweightTransport {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker: Arc::new(worker),
            live: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Transport for LightweightTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lightweight
    }

    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerHandle> {
        let handle = WorkerHandle::for_spec(&spec, TransportKind::Lightweight, None);
        let (cancel, rx) = watch::channel(false);
        let worker = Arc::clone(&self.worker);
        let worker_id = spec.worker_id.clone();
        let join = tokio::spawn(async move {
            let outcome = worker.run(&spec, rx).await;
            match &outcome {
                Ok(o) => {
                    tracing::debug!(task = %spec.task_id, worker = %spec.worker_id, outcome = ?o, "worker finished")
                }
                Err(e) => {
                    tracing::warn!(task = %spec.task_id, worker = %spec.worker_id, error = %e, "worker errored")
                }
            }
            outcome
        });
        self.live
            .lock()
            .await
            .insert(worker_id, LiveTask { join, cancel });
        Ok(handle)
    }

    async fn is_alive(&self, handle: &WorkerHandle) -> bool {
        let mut live = self.live.lock().await;
        match live.get(&handle.worker_id) {
            Some(t) if !t.join.is_finished() => true,
            Some(_) => {
                live.remove(&handle.worker_id);
                false
            }
            None => false,
        }
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<()> {
        if let Some(t) = self.live.lock().await.remove(&handle.worker_id) {
            if !t.join.is_finished() {
                let _ = t.cancel.send(true);
                tracing::info!(
                    task = %handle.task_id,
                    worker = %handle.worker_id,
                    "cancellation requested for lightweight worker"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::{AcceptAll, Invitation};
    use crate::error::LoomError;
    use crate::ledger::{EventKind, FileLedgerStore, Ledger, LedgerStore};
    use crate::task::{TaskGraph, TaskSpec};
    use crate::types::TaskStatus;
    use crate::work::{Checkpointer, WorkContext};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn offered(dir: &TempDir) -> (Arc<FileLedgerStore>, WorkerSpec) {
        let store = Arc::new(FileLedgerStore::in_dir(dir.path()).unwrap());
        let graph = TaskGraph::new(vec![TaskSpec::new("T1", "a"), TaskSpec::new("T2", "b")]);
        store
            .create(&Ledger::begin("c1", "m", &graph, 3, 5, Utc::now()).unwrap())
            .unwrap();
        store
            .append_event(
                "c1",
                EventKind::Invited {
                    invitation: Invitation {
                        ceremony_id: "c1".into(),
                        task_id: "T1".into(),
                        worker_id: "w1".into(),
                        description: "a".into(),
                        expected_benefit: String::new(),
                        attempt: 1,
                        replay: None,
                        resume_from: None,
                    },
                },
            )
            .unwrap();
        let spec = WorkerSpec {
            ceremony_id: "c1".into(),
            task_id: "T1".into(),
            worker_id: "w1".into(),
            ledger: store.location("c1"),
            debug: false,
        };
        (store, spec)
    }

    #[tokio::test]
    async fn spawned_worker_completes_and_is_reaped() {
        let dir = TempDir::new().unwrap();
        let (store, spec) = offered(&dir);
        let work = |_ctx: WorkContext, _cp: Checkpointer| async move { Ok::<_, LoomError>("done".to_string()) };
        let t = LightweightTransport::new(Worker::new(store.clone(), Arc::new(work), Arc::new(AcceptAll)));
        let handle = t.spawn(spec).await.unwrap();
        assert_eq!(handle.kind, TransportKind::Lightweight);

        for _ in 0..200 {
            if !t.is_alive(&handle).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!t.is_alive(&handle).await);
        assert!(t.live.lock().await.is_empty());
        let (ledger, _) = store.read("c1").unwrap();
        assert_eq!(ledger.task("T1").unwrap().status, TaskStatus::Complete);
    }

    #[tokio::test]
    async fn terminate_cancels_cooperatively() {
        let dir = TempDir::new().unwrap();
        let (store, spec) = offered(&dir);
        let work = |_ctx: WorkContext, cp: Checkpointer| async move {
            cp.checkpoint("partial").await?;
            std::future::pending::<()>().await;
            Ok::<_, LoomError>(String::new())
        };
        let t = LightweightTransport::new(Worker::new(store.clone(), Arc::new(work), Arc::new(AcceptAll)));
        let handle = t.spawn(spec).await.unwrap();
        for _ in 0..200 {
            let (ledger, _) = store.read("c1").unwrap();
            if ledger.task("T1").unwrap().output_partial {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(t.is_alive(&handle).await);
        t.terminate(&handle).await.unwrap();
        assert!(!t.is_alive(&handle).await);
        // Nothing after the checkpoint was recorded.
        let (ledger, _) = store.read("c1").unwrap();
        let t1 = ledger.task("T1").unwrap();
        assert_eq!(t1.status, TaskStatus::InProgress);
        assert_eq!(t1.output.as_deref(), Some("partial"));
    }
}
