use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ArtifactStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Complete,
    Partial,
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactStatus::Complete => "complete",
            ArtifactStatus::Partial => "partial",
            ArtifactStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(ArtifactStatus::Complete),
            "partial" => Ok(ArtifactStatus::Partial),
            "failed" => Ok(ArtifactStatus::Failed),
            other => Err(format!("unknown artifact status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Orchestrator lifecycle: `idle -> running -> {succeeded, failed} -> pruning -> done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Pruning,
    Done,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Pruning => "pruning",
            RunState::Done => "done",
        }
    }

    /// Whether `self -> to` is an edge of the lifecycle.
    pub fn can_transition_to(self, to: RunState) -> bool {
        matches!(
            (self, to),
            (RunState::Idle, RunState::Running)
                | (RunState::Idle, RunState::Pruning)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Succeeded, RunState::Pruning)
                | (RunState::Failed, RunState::Pruning)
                | (RunState::Pruning, RunState::Done)
                | (RunState::Done, RunState::Idle)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Classification of a failed run, carried in `RunResult` rather than raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    DumpProcess,
    EmptyDump,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::DumpProcess => "dump_process",
            ErrorKind::EmptyDump => "empty_dump",
            ErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_and_display_agree() {
        for s in [
            ArtifactStatus::Complete,
            ArtifactStatus::Partial,
            ArtifactStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<ArtifactStatus>().unwrap(), s);
        }
        assert!("done".parse::<ArtifactStatus>().is_err());
    }

    #[test]
    fn lifecycle_edges() {
        assert!(RunState::Idle.can_transition_to(RunState::Running));
        assert!(RunState::Failed.can_transition_to(RunState::Pruning));
        assert!(RunState::Done.can_transition_to(RunState::Idle));
        assert!(!RunState::Running.can_transition_to(RunState::Done));
        assert!(!RunState::Running.can_transition_to(RunState::Running));
        assert!(!RunState::Pruning.can_transition_to(RunState::Running));
    }
}
