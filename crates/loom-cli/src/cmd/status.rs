use crate::output::{one_line, print_json, print_table};
use crate::setup;
use anyhow::Context;
use loom_core::synthesis::CeremonyReport;
use loom_core::task;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct CeremonySummary {
    ceremony_id: String,
    status: String,
    revision: u64,
    summary: String,
    master_task: String,
}

pub fn run(root: &Path, ceremony: Option<&str>, json: bool) -> anyhow::Result<()> {
    match ceremony {
        Some(id) => show(root, id, json),
        None => list(root, json),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = setup::load_config(root)?;
    let store = setup::open_store(root, &config)?;
    let mut rows = Vec::new();
    for id in store.list().context("failed to list ceremonies")? {
        let (ledger, revision) = store
            .read(&id)
            .with_context(|| format!("failed to read ceremony '{id}'"))?;
        rows.push(CeremonySummary {
            ceremony_id: id,
            status: ledger.status().to_string(),
            revision,
            summary: task::summarize(&ledger.tasks),
            master_task: ledger.ceremony.master_task.clone(),
        });
    }

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No ceremonies. Start one with 'loom begin'.");
        return Ok(());
    }
    print_table(
        &["CEREMONY", "STATUS", "REV", "TASKS", "MASTER TASK"],
        rows.into_iter()
            .map(|r| {
                vec![
                    r.ceremony_id,
                    r.status,
                    r.revision.to_string(),
                    r.summary,
                    one_line(&r.master_task, 48),
                ]
            })
            .collect(),
    );
    Ok(())
}

fn load_report(root: &Path, id: &str) -> anyhow::Result<CeremonyReport> {
    let config = setup::load_config(root)?;
    let store = setup::open_store(root, &config)?;
    let (ledger, _) = store
        .read(id)
        .with_context(|| format!("failed to read ceremony '{id}'"))?;
    Ok(CeremonyReport::from_ledger(&ledger))
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let report = load_report(root, id)?;
    if json {
        return print_json(&report);
    }
    println!("{} [{}] rev {}", report.ceremony_id, report.status, report.revision);
    println!("{}", one_line(&report.master_task, 100));
    println!(
        "{} | retries {}/{}\n",
        report.summary, report.retries_used, report.retry_budget
    );
    print_table(
        &["TASK", "STATUS", "ATTEMPTS", "DEPENDS ON", "ASSIGNEE"],
        report
            .tasks
            .iter()
            .map(|t| {
                let status = if t.exhausted {
                    format!("{} (exhausted)", t.status)
                } else {
                    t.status.to_string()
                };
                vec![
                    t.id.clone(),
                    status,
                    t.attempts.to_string(),
                    t.depends_on.join(","),
                    t.assignee.clone().unwrap_or_else(|| "-".into()),
                ]
            })
            .collect(),
    );
    Ok(())
}

pub fn report(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let report = load_report(root, id)?;
    if json {
        return print_json(&report);
    }
    println!("{} [{}] {}", report.ceremony_id, report.status, report.summary);
    if let Some(reason) = &report.reason {
        println!("reason: {reason}");
    }
    println!("retries: {}/{}", report.retries_used, report.retry_budget);
    if report.outstanding.is_empty() {
        println!("\nEvery task is complete.");
        return Ok(());
    }
    println!();
    for f in &report.outstanding {
        let optional = if f.required { "" } else { " (optional)" };
        println!(
            "- {}{optional} [{}] after {} attempt(s): {}",
            f.task_id, f.status, f.attempts, f.reason
        );
    }
    Ok(())
}
