use anyhow::Context;
use loom_core::ledger::{FileLedgerStore, LedgerStore};
use loom_core::transport::WorkerSpec;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::setup;

/// Entry point of an isolated worker. Everything it learns about its task
/// comes from the ledger file it was handed.
pub fn run(
    root: &Path,
    ceremony: String,
    task: String,
    worker_id: String,
    ledger: PathBuf,
    debug: bool,
) -> anyhow::Result<()> {
    let config = setup::load_config(root)?;
    let (store, id) = FileLedgerStore::for_ledger_file(&ledger)
        .with_context(|| format!("cannot open ledger {}", ledger.display()))?;
    if id != ceremony {
        anyhow::bail!(
            "ledger {} belongs to ceremony '{id}', not '{ceremony}'",
            ledger.display()
        );
    }
    let store: Arc<dyn LedgerStore> = Arc::new(store);
    let worker = setup::worker(root, &config, store);
    let spec = WorkerSpec {
        ceremony_id: ceremony,
        task_id: task,
        worker_id,
        ledger,
        debug,
    };

    let rt = setup::runtime()?;
    // Never signalled: the isolated transport terminates by killing the process.
    let (_cancel, rx) = tokio::sync::watch::channel(false);
    let outcome = rt
        .block_on(worker.run(&spec, rx))
        .with_context(|| format!("worker {} failed on task '{}'", spec.worker_id, spec.task_id))?;
    tracing::info!(task = %spec.task_id, worker = %spec.worker_id, ?outcome, "worker exiting");
    Ok(())
}
