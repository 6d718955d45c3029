use crate::output::print_json;
use crate::setup;
use anyhow::Context;
use loom_core::types::{CeremonyStatus, ReplayMode, TransportKind};
use loom_core::{AdvanceReport, Loom, LoomError};
use std::path::Path;

// ---------------------------------------------------------------------------
// begin
// ---------------------------------------------------------------------------

pub fn begin(
    root: &Path,
    master_task: &str,
    graph: Option<&Path>,
    run_now: bool,
    json: bool,
) -> anyhow::Result<()> {
    let graph = graph.map(setup::read_graph).transpose()?;
    let loom = setup::build_loom(root, graph)?;
    let rt = setup::runtime()?;
    let id = rt
        .block_on(loom.begin_ceremony(master_task))
        .context("failed to begin ceremony")?;

    if !run_now {
        if json {
            print_json(&serde_json::json!({ "ceremony_id": id }))?;
        } else {
            println!("{id}");
        }
        return Ok(());
    }
    let status = rt.block_on(loom.run(&id))?;
    finish(&loom, &id, status, json)
}

// ---------------------------------------------------------------------------
// advance / run
// ---------------------------------------------------------------------------

pub fn advance(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let loom = setup::build_loom(root, None)?;
    if loom.config().transport.kind() == TransportKind::Lightweight {
        tracing::warn!("lightweight workers stop when this command exits; use 'loom run'");
    }
    let rt = setup::runtime()?;
    let report = rt
        .block_on(loom.advance(id))
        .with_context(|| format!("failed to advance ceremony '{id}'"))?;
    if json {
        print_json(&report)
    } else {
        print_advance(&report);
        Ok(())
    }
}

fn print_advance(report: &AdvanceReport) {
    let status = report
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    println!("{} [{status}] rev {}", report.ceremony_id, report.revision);
    for (label, ids) in [
        ("recovered", &report.recovered),
        ("offered", &report.offered),
        ("spawned", &report.spawned),
        ("reaped", &report.reaped),
    ] {
        if !ids.is_empty() {
            println!("  {label}: {}", ids.join(", "));
        }
    }
    if report.mutations == 0 {
        println!("  nothing to do");
    }
}

pub fn run(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let loom = setup::build_loom(root, None)?;
    let rt = setup::runtime()?;
    let status = rt
        .block_on(loom.run(id))
        .with_context(|| format!("failed while running ceremony '{id}'"))?;
    finish(&loom, id, status, json)
}

fn finish(loom: &Loom, id: &str, status: CeremonyStatus, json: bool) -> anyhow::Result<()> {
    let report = loom.report(id)?;
    if json {
        print_json(&report)?;
    } else {
        println!("{id} finished: {status} ({})", report.summary);
        if status != CeremonyStatus::Abandoned {
            println!("Next: loom synthesize {id}");
        }
    }
    if status == CeremonyStatus::Abandoned {
        let reason = report.reason.unwrap_or_else(|| "no reason recorded".into());
        anyhow::bail!("ceremony '{id}' was abandoned: {reason}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// synthesize
// ---------------------------------------------------------------------------

pub fn synthesize(root: &Path, id: &str, output: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let loom = setup::build_loom(root, None)?;
    let (synthesis, abandoned) = match loom.synthesize(id) {
        Ok(s) => (s, false),
        Err(LoomError::CeremonyAbandoned { partial }) => (*partial, true),
        Err(e) => return Err(e).with_context(|| format!("cannot synthesize '{id}'")),
    };

    let rendered = if json {
        serde_json::to_string_pretty(&serde_json::json!({
            "abandoned": abandoned,
            "synthesis": synthesis,
        }))?
    } else {
        synthesis.render()
    };
    match output {
        Some(path) => {
            loom_core::io::atomic_write(path, rendered.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => println!("{rendered}"),
    }

    if abandoned {
        anyhow::bail!(
            "ceremony '{id}' was abandoned; partial synthesis has {} gap(s)",
            synthesis.gaps.len()
        );
    }
    if synthesis.is_partial() {
        eprintln!(
            "warning: ceremony '{id}' is degraded; {} optional task(s) missing",
            synthesis.gaps.len()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// abandon / replay
// ---------------------------------------------------------------------------

pub fn abandon(root: &Path, id: &str, reason: &str, json: bool) -> anyhow::Result<()> {
    let loom = setup::build_loom(root, None)?;
    let rt = setup::runtime()?;
    rt.block_on(loom.abandon(id, reason))
        .with_context(|| format!("failed to abandon '{id}'"))?;
    if json {
        print_json(&serde_json::json!({ "ceremony_id": id, "status": CeremonyStatus::Abandoned }))
    } else {
        println!("{id} abandoned: {reason}");
        Ok(())
    }
}

pub fn replay(root: &Path, id: &str, task: &str, mode: ReplayMode, json: bool) -> anyhow::Result<()> {
    let loom = setup::build_loom(root, None)?;
    let rt = setup::runtime()?;
    rt.block_on(loom.replay(id, task, mode))
        .with_context(|| format!("failed to replay '{task}' in '{id}'"))?;
    if json {
        print_json(&serde_json::json!({ "ceremony_id": id, "task_id": task, "mode": mode }))
    } else {
        println!("{task} queued for {mode} replay; run 'loom advance {id}' to offer it");
        Ok(())
    }
}
