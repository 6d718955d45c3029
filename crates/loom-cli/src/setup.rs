//! Turns `.loom/config.yaml` into a wired-up [`Loom`].

use anyhow::{bail, Context};
use loom_core::command::{CommandDecomposer, CommandResponder, CommandWork, ExternalCommand};
use loom_core::config::{Config, ResponderConfig, StoreKind, TransportConfig};
use loom_core::consent::{AcceptAll, Responder};
use loom_core::decompose::{Decomposer, StaticDecomposer};
use loom_core::ledger::{FileLedgerStore, LedgerStore, RedbLedgerStore};
use loom_core::task::TaskGraph;
use loom_core::transport::{IsolatedTransport, LightweightTransport, Transport};
use loom_core::work::{NoWork, WorkFn};
use loom_core::worker::Worker;
use loom_core::{Loom, LoomError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start tokio runtime")
}

pub fn load_config(root: &Path) -> anyhow::Result<Config> {
    Config::load(root).context("failed to load .loom/config.yaml")
}

pub fn open_store(root: &Path, config: &Config) -> anyhow::Result<Arc<dyn LedgerStore>> {
    let store: Arc<dyn LedgerStore> = match config.store {
        StoreKind::File => Arc::new(FileLedgerStore::open(root).context("failed to open ledger directory")?),
        StoreKind::Redb => {
            Arc::new(RedbLedgerStore::open_root(root).context("failed to open ledger database")?)
        }
    };
    Ok(store)
}

pub fn work_fn(root: &Path, config: &Config) -> Arc<dyn WorkFn> {
    match &config.work {
        Some(cmd) => Arc::new(CommandWork(ExternalCommand::new(cmd.clone(), root))),
        None => Arc::new(NoWork),
    }
}

pub fn responder(root: &Path, config: &Config) -> Arc<dyn Responder> {
    match &config.responder {
        ResponderConfig::AcceptAll => Arc::new(AcceptAll),
        ResponderConfig::Command(cmd) => {
            Arc::new(CommandResponder(ExternalCommand::new(cmd.clone(), root)))
        }
    }
}

pub fn worker(root: &Path, config: &Config, store: Arc<dyn LedgerStore>) -> Worker {
    Worker::new(store, work_fn(root, config), responder(root, config))
        .with_heartbeat_interval(config.heartbeat_interval())
        .with_retry_policy(config.conflict_retry)
}

pub fn transport(
    root: &Path,
    config: &Config,
    store: Arc<dyn LedgerStore>,
) -> anyhow::Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match &config.transport {
        TransportConfig::Isolated {
            program,
            args,
            wrapper,
        } => {
            if config.store == StoreKind::Redb {
                bail!("isolated transport needs a ledger workers can open; set 'store: file'");
            }
            let (program, mut worker_args) = match program {
                Some(p) => (PathBuf::from(p), Vec::new()),
                // Our own binary: tell the worker where the project is.
                None => (
                    std::env::current_exe().context("cannot locate the loom binary")?,
                    vec!["--root".to_string(), root.display().to_string()],
                ),
            };
            worker_args.extend(args.iter().cloned());
            Arc::new(
                IsolatedTransport::new(program)
                    .with_args(worker_args)
                    .with_wrapper(wrapper.clone()),
            )
        }
        TransportConfig::Lightweight => {
            Arc::new(LightweightTransport::new(worker(root, config, store)))
        }
    };
    Ok(transport)
}

fn no_decomposer(_master_task: &str) -> loom_core::Result<TaskGraph> {
    Err(LoomError::Decomposition(
        "no decomposer configured; pass --graph or set 'decomposer' in config".into(),
    ))
}

pub fn decomposer(root: &Path, config: &Config, graph: Option<TaskGraph>) -> Arc<dyn Decomposer> {
    match (graph, &config.decomposer) {
        (Some(g), _) => Arc::new(StaticDecomposer(g)),
        (None, Some(cmd)) => Arc::new(CommandDecomposer(ExternalCommand::new(cmd.clone(), root))),
        (None, None) => Arc::new(no_decomposer),
    }
}

pub fn build_loom(root: &Path, graph: Option<TaskGraph>) -> anyhow::Result<Loom> {
    let config = load_config(root)?;
    for w in config.validate() {
        tracing::debug!(level = ?w.level, "{}", w.message);
    }
    let store = open_store(root, &config)?;
    let transport = transport(root, &config, Arc::clone(&store))?;
    let decomposer = decomposer(root, &config, graph);
    Ok(Loom::new(store, transport, decomposer, config))
}

pub fn read_graph(path: &Path) -> anyhow::Result<TaskGraph> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task graph {}", path.display()))?;
    let graph: TaskGraph = serde_yaml::from_str(&text)
        .with_context(|| format!("invalid task graph {}", path.display()))?;
    Ok(graph)
}
