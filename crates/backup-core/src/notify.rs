//! Hand-off of finished runs to external collaborators (log files, alerting
//! hooks). Delivery itself (mail, chat) lives outside this crate.

use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::report::BackupReport;
use std::path::PathBuf;
use std::process::{Command, Stdio};

pub trait Notifier {
    fn notify(&self, report: &BackupReport) -> Result<()>;
}

/// Appends the report's log line to a file.
#[derive(Debug, Clone)]
pub struct LogFileNotifier {
    pub path: PathBuf,
}

impl Notifier for LogFileNotifier {
    fn notify(&self, report: &BackupReport) -> Result<()> {
        crate::io::append_line(&self.path, &report.log_line())
    }
}

/// Runs a hook command with the outcome in its environment:
/// `BACKUP_STATUS`, `BACKUP_DETAIL`, `BACKUP_EXIT_CODE` and, when an artifact
/// was produced, `BACKUP_IDENTIFIER`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    pub program: String,
    pub args: Vec<String>,
}

impl Notifier for CommandNotifier {
    fn notify(&self, report: &BackupReport) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("BACKUP_STATUS", report.status_label())
            .env("BACKUP_DETAIL", report.detail())
            .env("BACKUP_EXIT_CODE", report.exit_code().to_string())
            .stdin(Stdio::null());
        if let Some(artifact) = &report.run.artifact {
            cmd.env("BACKUP_IDENTIFIER", &artifact.identifier);
        }
        let status = cmd.status().map_err(|source| BackupError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !status.success() {
            return Err(BackupError::Storage(format!(
                "notify hook '{}' exited with {status}",
                self.program
            )));
        }
        Ok(())
    }
}

/// Notifiers configured for this installation, in delivery order.
pub fn from_config(cfg: &Config) -> Vec<Box<dyn Notifier + Send + Sync>> {
    let mut out: Vec<Box<dyn Notifier + Send + Sync>> = Vec::new();
    if let Some(path) = &cfg.log_file {
        out.push(Box::new(LogFileNotifier { path: path.clone() }));
    }
    if let Some(program) = &cfg.notify.command {
        out.push(Box::new(CommandNotifier {
            program: program.trim().to_string(),
            args: cfg.notify.args.clone(),
        }));
    }
    out
}

/// Deliver to every notifier. Failures are logged and never affect the run.
pub fn deliver(notifiers: &[Box<dyn Notifier + Send + Sync>], report: &BackupReport) {
    for notifier in notifiers {
        if let Err(e) = notifier.notify(report) {
            tracing::warn!(error = %e, "notification failed");
        }
    }
}
