use crate::cmd::load_config;
use crate::output::print_json;
use anyhow::Context;
use backup_core::orchestrator::BackupOrchestrator;
use chrono::Utc;
use std::path::Path;

/// `backup prune [--dry-run]`: apply retention without dumping.
pub fn run(config: Option<&Path>, dry_run: bool, json: bool) -> anyhow::Result<i32> {
    let cfg = load_config(config)?;
    let orchestrator = BackupOrchestrator::from_config(&cfg).context("invalid configuration")?;
    let report = orchestrator.prune(dry_run).context("prune did not start")?;

    if json {
        print_json(&report)?;
    } else {
        let verb = if dry_run { "would delete" } else { "deleted" };
        let listed = if dry_run {
            &report.selected
        } else {
            &report.deleted
        };
        for id in listed {
            println!("{verb} {id}");
        }
        for failure in &report.failures {
            println!("failed {}: {}", failure.identifier, failure.message);
        }
        println!("{}", report.log_line(Utc::now()));
    }
    Ok(report.exit_code())
}
