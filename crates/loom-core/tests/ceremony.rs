use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use loom_core::config::Config;
use loom_core::consent::{AcceptAll, Invitation, Responder, Response};
use loom_core::decompose::StaticDecomposer;
use loom_core::ledger::{EventKind, FileLedgerStore, Ledger, LedgerStore, RetryPolicy};
use loom_core::task::{TaskGraph, TaskSpec};
use loom_core::transport::{LightweightTransport, Transport, WorkerHandle, WorkerSpec};
use loom_core::types::{CeremonyStatus, ReplayMode, TaskStatus, TransportKind};
use loom_core::work::{Checkpointer, WorkContext, WorkFn};
use loom_core::worker::Worker;
use loom_core::{Loom, LoomError, Result};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    store: Arc<FileLedgerStore>,
    loom: Loom,
}

fn test_config() -> Config {
    Config {
        poll_interval_ms: 10,
        conflict_retry: RetryPolicy::new(20, 1),
        ..Config::default()
    }
}

fn harness(
    graph: TaskGraph,
    config: Config,
    work: impl WorkFn + 'static,
    responder: impl Responder + 'static,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileLedgerStore::open(dir.path()).unwrap());
    let worker = Worker::new(store.clone(), Arc::new(work), Arc::new(responder))
        .with_heartbeat_interval(config.heartbeat_interval())
        .with_retry_policy(config.conflict_retry);
    let transport = LightweightTransport::new(worker);
    let loom = Loom::new(
        store.clone(),
        Arc::new(transport),
        Arc::new(StaticDecomposer(graph)),
        config,
    );
    Harness {
        _dir: dir,
        store,
        loom,
    }
}

async fn run_to_end(loom: &Loom, id: &str) -> CeremonyStatus {
    tokio::time::timeout(Duration::from_secs(10), loom.run(id))
        .await
        .expect("ceremony did not finish in time")
        .unwrap()
}

fn echo(ctx: WorkContext, _cp: Checkpointer) -> impl std::future::Future<Output = Result<String>> + Send {
    async move { Ok(format!("output of {}", ctx.task_id)) }
}

fn seq_of(ledger: &Ledger, pred: impl Fn(&EventKind) -> bool) -> Vec<u64> {
    ledger
        .events
        .iter()
        .filter(|e| pred(&e.event))
        .map(|e| e.seq)
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn independent_tasks_are_offered_together_and_synthesized() {
    let graph = TaskGraph::new(vec![
        TaskSpec::new("T1", "intro"),
        TaskSpec::new("T2", "body"),
        TaskSpec::new("T3", "outro"),
    ]);
    let h = harness(graph, test_config(), echo, AcceptAll);
    let id = h.loom.begin_ceremony("write an essay").await.unwrap();

    let first = h.loom.advance(&id).await.unwrap();
    assert_eq!(first.offered, vec!["T1", "T2", "T3"]);

    assert_eq!(run_to_end(&h.loom, &id).await, CeremonyStatus::Complete);
    let synthesis = h.loom.synthesize(&id).unwrap();
    assert!(!synthesis.is_partial());
    let text = synthesis.render();
    for t in ["T1", "T2", "T3"] {
        assert!(text.contains(&format!("output of {t}")), "{text}");
    }

    let (ledger, _) = h.store.read(&id).unwrap();
    let invited = seq_of(&ledger, |e| matches!(e, EventKind::Invited { .. }));
    let started = seq_of(&ledger, |e| matches!(e, EventKind::Started { .. }));
    assert_eq!(invited.len(), 3);
    assert!(invited.iter().max() < started.iter().min());
}

#[tokio::test]
async fn dependent_is_never_offered_before_dependency_completes() {
    let graph = TaskGraph::new(vec![
        TaskSpec::new("T1", "outline"),
        TaskSpec::new("T2", "draft").depends_on(["T1"]),
    ]);
    let work = |ctx: WorkContext, _cp: Checkpointer| async move {
        if ctx.task_id == "T2" {
            assert_eq!(ctx.dependency_outputs, vec![("T1".to_string(), "outline done".to_string())]);
        }
        Ok::<_, LoomError>(format!("{} done", ctx.description))
    };
    let h = harness(graph, test_config(), work, AcceptAll);
    let id = h.loom.begin_ceremony("write a draft").await.unwrap();
    assert_eq!(run_to_end(&h.loom, &id).await, CeremonyStatus::Complete);

    let (ledger, _) = h.store.read(&id).unwrap();
    let t1_done = seq_of(&ledger, |e| matches!(e, EventKind::Completed { task, .. } if task == "T1"));
    let t2_offered = seq_of(
        &ledger,
        |e| matches!(e, EventKind::Invited { invitation } if invitation.task_id == "T2"),
    );
    assert_eq!(t1_done.len(), 1);
    assert_eq!(t2_offered.len(), 1);
    assert!(t1_done[0] < t2_offered[0]);
}

#[tokio::test]
async fn declined_task_is_reassigned_once() {
    let graph = TaskGraph::new(vec![TaskSpec::new("X", "picky"), TaskSpec::new("W", "easy")]);
    let responder = |inv: &Invitation| {
        if inv.task_id == "X" && inv.attempt == 1 {
            Response::Decline {
                reason: "not my area".into(),
            }
        } else {
            Response::Accept
        }
    };
    let h = harness(graph, test_config(), echo, responder);
    let id = h.loom.begin_ceremony("two chores").await.unwrap();
    assert_eq!(run_to_end(&h.loom, &id).await, CeremonyStatus::Complete);

    let (ledger, _) = h.store.read(&id).unwrap();
    let x = ledger.task("X").unwrap();
    assert_eq!(x.status, TaskStatus::Complete);
    assert_eq!(x.attempts, 2);
    assert_eq!(ledger.task("W").unwrap().attempts, 1);
    // Declines do not touch the ceremony-wide budget.
    assert_eq!(ledger.ceremony.retries_used, 0);
    let x_invites = seq_of(
        &ledger,
        |e| matches!(e, EventKind::Invited { invitation } if invitation.task_id == "X"),
    );
    assert_eq!(x_invites.len(), 2);
}

#[tokio::test]
async fn stalled_task_resumes_with_partial_output_in_shared_context() {
    let graph = TaskGraph::new(vec![TaskSpec::new("Y", "long job"), TaskSpec::new("Q", "quick")]);
    let seen: Arc<Mutex<Vec<WorkContext>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let work = move |ctx: WorkContext, cp: Checkpointer| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(ctx.clone());
            if ctx.task_id == "Y" && ctx.attempt == 1 {
                cp.checkpoint("first half").await?;
                std::future::pending::<()>().await;
            }
            Ok::<_, LoomError>(format!("{} finished", ctx.task_id))
        }
    };
    let config = Config {
        // No heartbeats: the checkpoint is the last sign of life.
        heartbeat_interval_secs: 3600,
        ..test_config()
    };
    let h = harness(graph, config, work, AcceptAll);
    let loom = h.loom.with_heartbeat_timeout(Duration::from_millis(150));
    let id = loom.begin_ceremony("a long job").await.unwrap();
    assert_eq!(run_to_end(&loom, &id).await, CeremonyStatus::Complete);

    let seen = seen.lock().unwrap();
    let second = seen
        .iter()
        .find(|c| c.task_id == "Y" && c.attempt == 2)
        .expect("Y was re-spawned");
    assert!(second.shared_context.contains("first half"), "{}", second.shared_context);
    assert_eq!(second.resume_from.as_deref(), Some("first half"));

    let (ledger, _) = h.store.read(&id).unwrap();
    assert!(ledger.events.iter().any(|e| matches!(
        &e.event,
        EventKind::Reverted { task, replay: Some(ReplayMode::Resume), keep_output: true, .. } if task == "Y"
    )));
    assert_eq!(ledger.task("Y").unwrap().output.as_deref(), Some("Y finished"));
}

#[tokio::test]
async fn exhausted_task_abandons_with_partial_synthesis() {
    let graph = TaskGraph::new(vec![
        TaskSpec::new("A", "left"),
        TaskSpec::new("B", "right"),
        TaskSpec::new("Z", "join").depends_on(["A", "B"]),
    ]);
    let work = |ctx: WorkContext, _cp: Checkpointer| async move {
        if ctx.task_id == "Z" {
            return Err(LoomError::WorkFailed("cannot join".into()));
        }
        Ok(format!("{} ok", ctx.task_id))
    };
    let config = Config {
        max_attempts: 2,
        ..test_config()
    };
    let h = harness(graph, config, work, AcceptAll);
    let id = h.loom.begin_ceremony("join two halves").await.unwrap();
    assert_eq!(run_to_end(&h.loom, &id).await, CeremonyStatus::Abandoned);

    let partial = match h.loom.synthesize(&id) {
        Err(LoomError::CeremonyAbandoned { partial }) => partial,
        other => panic!("expected CeremonyAbandoned, got {other:?}"),
    };
    let sections: Vec<&str> = partial.sections.iter().map(|s| s.task_id.as_str()).collect();
    assert_eq!(sections, vec!["A", "B"]);
    assert_eq!(partial.gaps.len(), 1);
    let z = &partial.gaps[0];
    assert_eq!(z.task_id, "Z");
    assert_eq!(z.status, TaskStatus::Failed);
    assert_eq!(z.attempts, 2);
    assert!(z.reason.contains("cannot join"), "{}", z.reason);

    let report = h.loom.report(&id).unwrap();
    assert_eq!(report.outstanding.len(), 1);
    assert_eq!(report.retries_used, 1);

    // Nothing left to replay into.
    assert!(matches!(
        h.loom.replay(&id, "Z", ReplayMode::Debug).await,
        Err(LoomError::InvalidTransition { .. })
    ));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_task_graph_is_not_a_ceremony() {
    let graph = TaskGraph::new(vec![TaskSpec::new("only", "all of it")]);
    let h = harness(graph, test_config(), echo, AcceptAll);
    assert!(matches!(
        h.loom.begin_ceremony("small").await,
        Err(LoomError::Decomposition(_))
    ));
    assert!(h.store.list().unwrap().is_empty());
}

#[tokio::test]
async fn synthesize_before_finish_is_incomplete() {
    let graph = TaskGraph::new(vec![TaskSpec::new("A", "a"), TaskSpec::new("B", "b")]);
    let h = harness(graph, test_config(), echo, AcceptAll);
    let id = h.loom.begin_ceremony("m").await.unwrap();
    assert!(matches!(
        h.loom.synthesize(&id),
        Err(LoomError::IncompleteCeremony {
            status: CeremonyStatus::Active,
            ..
        })
    ));
}

#[tokio::test]
async fn abandon_stops_offering() {
    let graph = TaskGraph::new(vec![TaskSpec::new("A", "a"), TaskSpec::new("B", "b")]);
    let h = harness(graph, test_config(), echo, AcceptAll);
    let id = h.loom.begin_ceremony("m").await.unwrap();
    h.loom.abandon(&id, "operator changed their mind").await.unwrap();

    let report = h.loom.advance(&id).await.unwrap();
    assert!(report.offered.is_empty());
    assert_eq!(report.status, Some(CeremonyStatus::Abandoned));
    let r = h.loom.report(&id).unwrap();
    assert_eq!(r.reason.as_deref(), Some("operator changed their mind"));
    assert!(matches!(
        h.loom.synthesize(&id),
        Err(LoomError::CeremonyAbandoned { .. })
    ));
}

#[tokio::test]
async fn optional_failure_degrades_and_debug_replay_recovers() {
    let graph = TaskGraph::new(vec![
        TaskSpec::new("core", "must have"),
        TaskSpec::new("extra", "nice to have").optional(),
    ]);
    let work = |ctx: WorkContext, _cp: Checkpointer| async move {
        if ctx.task_id == "extra" && !ctx.debug {
            return Err(LoomError::WorkFailed("flaky".into()));
        }
        Ok(format!("{} ok", ctx.task_id))
    };
    let config = Config {
        max_attempts: 1,
        ..test_config()
    };
    let h = harness(graph, config, work, AcceptAll);
    let id = h.loom.begin_ceremony("m").await.unwrap();
    assert_eq!(run_to_end(&h.loom, &id).await, CeremonyStatus::Degraded);
    let synthesis = h.loom.synthesize(&id).unwrap();
    assert_eq!(synthesis.gaps.len(), 1);
    assert!(synthesis.render().contains("## Gaps"));

    assert!(matches!(
        h.loom.replay(&id, "extra", ReplayMode::Restart).await,
        Err(LoomError::InvalidTransition { .. })
    ));
    let before = h.loom.report(&id).unwrap().retries_used;
    h.loom.replay(&id, "extra", ReplayMode::Debug).await.unwrap();
    assert_eq!(run_to_end(&h.loom, &id).await, CeremonyStatus::Complete);
    let (ledger, _) = h.store.read(&id).unwrap();
    assert_eq!(ledger.ceremony.retries_used, before);
    assert_eq!(ledger.task("extra").unwrap().attempts, 1);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_task_is_lost_and_no_start_without_accept() {
    let graph = TaskGraph::new(vec![
        TaskSpec::new("a", "a"),
        TaskSpec::new("b", "b").depends_on(["a"]),
        TaskSpec::new("c", "c").depends_on(["a"]),
        TaskSpec::new("d", "d").depends_on(["b", "c"]).optional(),
    ]);
    let responder = |inv: &Invitation| match (inv.task_id.as_str(), inv.attempt) {
        ("b", 1) => Response::RequestClarification {
            text: "how long?".into(),
        },
        ("c", 1) => Response::ProposeAlternative {
            text: "split it".into(),
        },
        _ => Response::Accept,
    };
    let work = |ctx: WorkContext, _cp: Checkpointer| async move {
        if ctx.task_id == "d" {
            return Err(LoomError::WorkFailed("nope".into()));
        }
        Ok(ctx.task_id.clone())
    };
    let h = harness(graph, test_config(), work, responder);
    let id = h.loom.begin_ceremony("m").await.unwrap();
    let status = run_to_end(&h.loom, &id).await;
    assert_eq!(status, CeremonyStatus::Degraded);

    let (ledger, _) = h.store.read(&id).unwrap();
    for t in &ledger.tasks {
        assert!(
            t.status == TaskStatus::Complete || (t.status == TaskStatus::Failed && t.exhausted),
            "task {} ended {}",
            t.id,
            t.status
        );
    }
    assert!(ledger.shared_context_text().contains("how long?"));
    assert!(ledger.shared_context_text().contains("split it"));

    for (i, e) in ledger.events.iter().enumerate() {
        let EventKind::Started { task, worker } = &e.event else {
            continue;
        };
        let before = &ledger.events[..i];
        let invited = before.iter().rposition(|p| {
            matches!(&p.event, EventKind::Invited { invitation }
                if &invitation.task_id == task && &invitation.worker_id == worker)
        });
        let accepted = before.iter().rposition(|p| {
            matches!(&p.event, EventKind::Responded { task: t, worker: w, response: Response::Accept }
                if t == task && w == worker)
        });
        match (invited, accepted) {
            (Some(inv), Some(acc)) => assert!(inv < acc),
            _ => panic!("{task} started by {worker} without invitation and accept"),
        }
    }
}

#[test]
fn concurrent_writes_at_same_revision_exactly_one_succeeds() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileLedgerStore::open(dir.path()).unwrap());
    let graph = TaskGraph::new(vec![TaskSpec::new("A", "a"), TaskSpec::new("B", "b")]);
    let ledger = Ledger::begin("c1", "m", &graph, 3, 5, chrono::Utc::now()).unwrap();
    let rev = store.create(&ledger).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                store.write("c1", rev, &mut |l: &mut Ledger| {
                    l.record(EventKind::Noted {
                        task: None,
                        text: format!("writer {i}"),
                    })
                })
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(LoomError::RevisionConflict { .. })))
        .count();
    assert_eq!((ok, conflicts), (1, 1));
    let (ledger, after) = store.read("c1").unwrap();
    assert_eq!(after, rev + 1);
    assert_eq!(ledger.shared_context.len(), 1);
}

#[derive(Default)]
struct RecordingTransport {
    spawned: Mutex<Vec<WorkerSpec>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lightweight
    }

    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerHandle> {
        let handle = WorkerHandle {
            worker_id: spec.worker_id.clone(),
            ceremony_id: spec.ceremony_id.clone(),
            task_id: spec.task_id.clone(),
            kind: TransportKind::Lightweight,
            pid: None,
            spawned_at: chrono::Utc::now(),
        };
        self.spawned.lock().unwrap().push(spec);
        Ok(handle)
    }

    async fn is_alive(&self, _handle: &WorkerHandle) -> bool {
        true
    }

    async fn terminate(&self, _handle: &WorkerHandle) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn advance_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileLedgerStore::open(dir.path()).unwrap());
    let transport = Arc::new(RecordingTransport::default());
    let graph = TaskGraph::new(vec![
        TaskSpec::new("A", "a"),
        TaskSpec::new("B", "b"),
        TaskSpec::new("C", "c").depends_on(["A"]),
    ]);
    let loom = Loom::new(
        store.clone(),
        transport.clone(),
        Arc::new(StaticDecomposer(graph)),
        test_config(),
    );
    let id = loom.begin_ceremony("m").await.unwrap();

    let first = loom.advance(&id).await.unwrap();
    assert_eq!(first.offered, vec!["A", "B"]);
    assert_eq!(transport.spawned.lock().unwrap().len(), 2);

    for _ in 0..3 {
        let again = loom.advance(&id).await.unwrap();
        assert_eq!(again.mutations, 0);
        assert!(again.offered.is_empty());
        assert_eq!(again.revision, first.revision);
    }
    assert_eq!(transport.spawned.lock().unwrap().len(), 2);
}

struct BrokenTransport;

#[async_trait]
impl Transport for BrokenTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Isolated
    }

    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerHandle> {
        Err(LoomError::WorkerSpawn {
            task: spec.task_id,
            reason: "no capacity".into(),
        })
    }

    async fn is_alive(&self, _handle: &WorkerHandle) -> bool {
        false
    }

    async fn terminate(&self, _handle: &WorkerHandle) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn advance_waits_for_a_foreign_lock_without_stalling_workers() {
    let graph = TaskGraph::new(vec![TaskSpec::new("A", "first"), TaskSpec::new("B", "second")]);
    let h = harness(graph, test_config(), echo, AcceptAll);
    let id = h.loom.begin_ceremony("two parts").await.unwrap();

    // Another process is mid-write.
    let lock = loom_core::paths::lock_file(&loom_core::paths::ceremonies_dir(h._dir.path()), &id);
    std::fs::write(&lock, "4242").unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let ticks = Arc::clone(&ticks);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::remove_file(&lock).unwrap();
    });

    let report = h.loom.advance(&id).await.unwrap();
    release.await.unwrap();
    ticker.abort();

    assert_eq!(report.offered, vec!["A", "B"]);
    let ticks = ticks.load(Ordering::SeqCst);
    assert!(ticks >= 20, "runtime stalled during lock wait: {ticks} ticks");
    assert_eq!(run_to_end(&h.loom, &id).await, CeremonyStatus::Complete);
}

#[tokio::test]
async fn spawn_failures_consume_budget_until_abandoned() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileLedgerStore::open(dir.path()).unwrap());
    let graph = TaskGraph::new(vec![TaskSpec::new("A", "a"), TaskSpec::new("B", "b")]);
    let config = Config {
        max_attempts: 2,
        spawn_retry: RetryPolicy::new(2, 1),
        ..test_config()
    };
    let loom = Loom::new(
        store.clone(),
        Arc::new(BrokenTransport),
        Arc::new(StaticDecomposer(graph)),
        config,
    );
    let id = loom.begin_ceremony("m").await.unwrap();
    assert_eq!(run_to_end(&loom, &id).await, CeremonyStatus::Abandoned);

    let (ledger, _) = store.read(&id).unwrap();
    assert_eq!(ledger.ceremony.retries_used, 4);
    for t in &ledger.tasks {
        assert!(t.exhausted);
        assert_eq!(t.attempts, 2);
    }
}

#[tokio::test]
async fn ledger_survives_document_roundtrip_and_rebuild() {
    let graph = TaskGraph::new(vec![
        TaskSpec::new("A", "a"),
        TaskSpec::new("B", "b").depends_on(["A"]),
    ]);
    let h = harness(graph, test_config(), echo, AcceptAll);
    let id = h.loom.begin_ceremony("m").await.unwrap();
    run_to_end(&h.loom, &id).await;

    let (ledger, _) = h.store.read(&id).unwrap();
    let doc = ledger.to_document().unwrap();
    let parsed = Ledger::from_document(&doc).unwrap();
    assert_eq!(parsed.tasks, ledger.tasks);
    assert_eq!(parsed.ceremony, ledger.ceremony);

    let rebuilt = Ledger::rebuild(&id, &ledger.events).unwrap();
    assert_eq!(rebuilt.tasks, ledger.tasks);
    assert_eq!(rebuilt.status(), ledger.status());
    assert_eq!(rebuilt.shared_context, ledger.shared_context);
}
