//! Run and prune results, and the one-line log format handed to the
//! log/notification collaborators.

use crate::artifact::Artifact;
use crate::error::BackupError;
use crate::types::{ErrorKind, RunStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RunResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BackupError> for RunError {
    fn from(err: &BackupError) -> Self {
        let kind = match err {
            BackupError::Timeout(_) => ErrorKind::Timeout,
            BackupError::DumpProcess { .. } | BackupError::Spawn { .. } => ErrorKind::DumpProcess,
            BackupError::EmptyDump => ErrorKind::EmptyDump,
            _ => ErrorKind::Storage,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Outcome of one dump attempt. Built once by the runner and not mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    fn detail(&self) -> String {
        match (&self.error, &self.artifact) {
            (None, Some(a)) => {
                let sum = a.checksum.as_deref().unwrap_or("-");
                format!(
                    "backup {} written ({} bytes, sha256 {}) in {:.1}s",
                    a.identifier,
                    a.size_bytes,
                    sum.get(..12).unwrap_or(sum),
                    self.duration_seconds()
                )
            }
            (Some(e), Some(a)) => format!("{}: {} (kept as {} {})", e.kind, e.message, a.status, a.identifier),
            (Some(e), None) => format!("{}: {}", e.kind, e.message),
            (None, None) => "no artifact produced".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// PruneReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneFailure {
    pub identifier: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    pub dry_run: bool,
    /// Everything the retention policy selected, newest first.
    pub selected: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<PruneFailure>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn detail(&self) -> String {
        let mut out = if self.dry_run {
            format!("would prune {}", self.selected.len())
        } else {
            format!("pruned {}", self.deleted.len())
        };
        if !self.failures.is_empty() {
            let list: Vec<String> = self
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.identifier, f.message))
                .collect();
            out.push_str(&format!(
                ", {} deletion(s) failed [{}]",
                self.failures.len(),
                list.join("; ")
            ));
        }
        out
    }

    pub fn log_line(&self, at: DateTime<Utc>) -> String {
        let status = if self.is_clean() { "PRUNED" } else { "PRUNE_FAILED" };
        format_log_line(at, status, &self.detail())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// BackupReport
// ---------------------------------------------------------------------------

/// Everything one `backup run` invocation did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupReport {
    pub run: RunResult,
    pub prune: PruneReport,
}

impl BackupReport {
    /// 0 when the dump succeeded and every selected deletion went through.
    pub fn exit_code(&self) -> i32 {
        if self.run.succeeded() && self.prune.is_clean() {
            0
        } else {
            1
        }
    }

    pub fn status_label(&self) -> &'static str {
        match (self.run.succeeded(), self.prune.is_clean()) {
            (true, true) => "SUCCESS",
            (true, false) => "PRUNE_FAILED",
            (false, _) => "FAILED",
        }
    }

    pub fn detail(&self) -> String {
        format!("{}; {}", self.run.detail(), self.prune.detail())
    }

    pub fn log_line(&self) -> String {
        format_log_line(self.run.finished_at, self.status_label(), &self.detail())
    }
}

/// `<ISO8601 timestamp> - <STATUS> - <detail>`
pub fn format_log_line(at: DateTime<Utc>, status: &str, detail: &str) -> String {
    format!(
        "{} - {} - {}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        status,
        detail.replace('\n', " ")
    )
}
