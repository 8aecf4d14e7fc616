use crate::cmd::load_config;
use crate::output::print_json;
use anyhow::Context;
use backup_core::notify;
use backup_core::orchestrator::BackupOrchestrator;
use std::path::Path;

/// `backup run`: dump, prune, notify. Returns the process exit code.
pub fn run(config: Option<&Path>, json: bool) -> anyhow::Result<i32> {
    let cfg = load_config(config)?;
    let orchestrator = BackupOrchestrator::from_config(&cfg).context("invalid configuration")?;
    let notifiers = notify::from_config(&cfg);

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt
        .block_on(orchestrator.run())
        .context("backup run did not start")?;

    notify::deliver(&notifiers, &report);

    if json {
        print_json(&report)?;
    } else {
        println!("{}", report.log_line());
    }
    Ok(report.exit_code())
}
