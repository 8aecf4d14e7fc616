use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("a backup run is already in progress: {0}")]
    AlreadyRunning(String),

    #[error("dump did not finish within {0}s")]
    Timeout(u64),

    #[error("dump command {}: {stderr}", exit_description(*.code))]
    DumpProcess { code: Option<i32>, stderr: String },

    #[error("failed to start dump command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dump command exited successfully but produced no output")]
    EmptyDump,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("checksum mismatch for {identifier}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        identifier: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

fn exit_description(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exited with code {c}"),
        None => "terminated by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_process_message_includes_exit_code() {
        let err = BackupError::DumpProcess {
            code: Some(1),
            stderr: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "dump command exited with code 1: connection refused"
        );
    }

    #[test]
    fn dump_process_message_for_signal() {
        let err = BackupError::DumpProcess {
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }
}
