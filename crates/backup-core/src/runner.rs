//! Invocation of the external dump command.
//!
//! The command's stdout is streamed into an `ArtifactWriter`; stderr is
//! drained in a background task and its last lines kept for diagnosis. The
//! whole stream-and-wait sequence runs under a `tokio::time::timeout`
//! watchdog; on expiry the child is killed and the partial artifact discarded.

use crate::artifact::Artifact;
use crate::config::DumpConfig;
use crate::error::{BackupError, Result};
use crate::report::{RunError, RunResult};
use crate::store::{ArtifactStore, ArtifactWriter};
use crate::types::{ArtifactStatus, RunStatus};
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 20;
/// How long to wait for stderr EOF after the child exits; a grandchild that
/// inherited the pipe can otherwise hold it open indefinitely.
const STDERR_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// DumpCommand
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DumpCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl DumpCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    fn build(&self, identifier: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("BACKUP_IDENTIFIER", identifier)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout also reaches whatever a wrapper
        // script started.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl From<&DumpConfig> for DumpCommand {
    fn from(cfg: &DumpConfig) -> Self {
        Self {
            program: cfg.command.trim().to_string(),
            args: cfg.args.clone(),
            env: cfg.env.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// DumpRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DumpRunner {
    command: DumpCommand,
    timeout: Duration,
}

/// What one attempt left behind, before it is frozen into a `RunResult`.
struct Attempt {
    artifact: Option<Artifact>,
    exit_code: Option<i32>,
    bytes: u64,
    error: Option<BackupError>,
}

impl Attempt {
    fn failed(error: BackupError, bytes: u64) -> Self {
        Self {
            artifact: None,
            exit_code: None,
            bytes,
            error: Some(error),
        }
    }
}

impl DumpRunner {
    pub fn new(command: DumpCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the dump once into `store`.
    ///
    /// Never returns an error: every failure mode is recorded in the
    /// `RunResult` (`status: failed` plus `error`).
    pub async fn run(&self, store: &ArtifactStore) -> RunResult {
        let started_at = Utc::now();
        let attempt = self.attempt(store).await;
        let finished_at = Utc::now();

        let status = if attempt.error.is_none() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        if let Some(err) = &attempt.error {
            tracing::warn!(error = %err, "dump failed");
        }

        RunResult {
            started_at,
            finished_at,
            status,
            exit_code: attempt.exit_code,
            bytes_written: attempt.bytes,
            artifact: attempt.artifact,
            error: attempt.error.as_ref().map(RunError::from),
        }
    }

    async fn attempt(&self, store: &ArtifactStore) -> Attempt {
        let mut writer = match store.begin_write(Utc::now()).await {
            Ok(w) => w,
            Err(e) => return Attempt::failed(e, 0),
        };
        let identifier = writer.identifier().to_string();

        tracing::info!(
            identifier = %identifier,
            program = %self.command.program,
            timeout_secs = self.timeout.as_secs(),
            "starting dump"
        );

        let mut child = match self.command.build(&identifier).spawn() {
            Ok(c) => c,
            Err(source) => {
                return Attempt::failed(
                    BackupError::Spawn {
                        program: self.command.program.clone(),
                        source,
                    },
                    0,
                )
            }
        };

        let stderr_task = child.stderr.take().map(drain_stderr);

        let waited = tokio::time::timeout(self.timeout, stream_and_wait(&mut child, &mut writer)).await;

        match waited {
            Err(_elapsed) => {
                kill(&mut child).await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                let bytes = writer.bytes_written();
                if let Err(e) = writer.discard().await {
                    tracing::warn!(error = %e, "failed to discard timed-out artifact");
                }
                Attempt::failed(BackupError::Timeout(self.timeout.as_secs()), bytes)
            }
            Ok(Err(e)) => {
                kill(&mut child).await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                let bytes = writer.bytes_written();
                if let Err(discard_err) = writer.discard().await {
                    tracing::warn!(error = %discard_err, "failed to discard artifact");
                }
                Attempt::failed(e, bytes)
            }
            Ok(Ok(status)) => {
                let stderr = match stderr_task {
                    Some(task) => collect_stderr(task).await,
                    None => String::new(),
                };
                self.finish(writer, status, stderr).await
            }
        }
    }

    async fn finish(&self, writer: ArtifactWriter, status: ExitStatus, stderr: String) -> Attempt {
        let bytes = writer.bytes_written();
        let code = status.code();

        if status.success() {
            if bytes == 0 {
                if let Err(e) = writer.discard().await {
                    tracing::warn!(error = %e, "failed to discard empty artifact");
                }
                return Attempt {
                    exit_code: code,
                    ..Attempt::failed(BackupError::EmptyDump, 0)
                };
            }
            return match writer.commit(ArtifactStatus::Complete, code).await {
                Ok(artifact) => Attempt {
                    artifact: Some(artifact),
                    exit_code: code,
                    bytes,
                    error: None,
                },
                Err(e) => Attempt {
                    exit_code: code,
                    ..Attempt::failed(e, bytes)
                },
            };
        }

        // Keep what the tool wrote for diagnosis, but never as a complete backup.
        let failure = BackupError::DumpProcess { code, stderr };
        match writer.commit(ArtifactStatus::Partial, code).await {
            Ok(artifact) => Attempt {
                artifact: Some(artifact),
                exit_code: code,
                bytes,
                error: Some(failure),
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to keep partial artifact");
                Attempt {
                    exit_code: code,
                    ..Attempt::failed(failure, bytes)
                }
            }
        }
    }
}

/// Copy the child's stdout into the writer until EOF, then reap the child.
async fn stream_and_wait(child: &mut Child, writer: &mut ArtifactWriter) -> Result<ExitStatus> {
    if let Some(stdout) = child.stdout.take() {
        copy_into(stdout, writer).await?;
    }
    Ok(child.wait().await?)
}

async fn copy_into<R: AsyncRead + Unpin>(mut reader: R, writer: &mut ArtifactWriter) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_chunk(&buf[..n]).await?;
        total += n as u64;
    }
}

fn drain_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(line = %line, "dump stderr");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

async fn collect_stderr(mut task: JoinHandle<String>) -> String {
    match tokio::time::timeout(STDERR_GRACE, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

async fn kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        // SAFETY: kill(2) has no memory-safety preconditions; the negative pid
        // addresses the group created for this child at spawn.
        if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
            tracing::debug!(
                error = %std::io::Error::last_os_error(),
                "failed to signal dump process group"
            );
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill dump process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;
    use tempfile::TempDir;

    fn sh(script: &str, timeout: Duration) -> DumpRunner {
        DumpRunner::new(DumpCommand::new("sh", ["-c", script]), timeout)
    }

    fn temp_files(root: &std::path::Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count()
    }

    #[tokio::test]
    async fn successful_dump_produces_complete_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let result = sh("printf 'CREATE TABLE t;'", Duration::from_secs(10))
            .run(&store)
            .await;

        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.bytes_written, 15);
        let artifact = result.artifact.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Complete);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"CREATE TABLE t;");
        store.verify(&artifact.identifier).unwrap();
    }

    #[tokio::test]
    async fn identifier_is_exported_to_the_dump() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let result = sh("printf \"$BACKUP_IDENTIFIER\"", Duration::from_secs(10))
            .run(&store)
            .await;
        let artifact = result.artifact.unwrap();
        assert_eq!(
            std::fs::read_to_string(&artifact.path).unwrap(),
            artifact.identifier
        );
    }

    #[tokio::test]
    async fn configured_env_reaches_the_dump() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let mut command = DumpCommand::new("sh", ["-c", "printf \"$PGDATABASE\""]);
        command.env.insert("PGDATABASE".into(), "shop".into());
        let result = DumpRunner::new(command, Duration::from_secs(10)).run(&store).await;
        let artifact = result.artifact.unwrap();
        assert_eq!(std::fs::read_to_string(&artifact.path).unwrap(), "shop");
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_partial_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let result = sh(
            "printf 'half'; echo 'pg_dump: connection lost' >&2; exit 1",
            Duration::from_secs(10),
        )
        .run(&store)
        .await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.exit_code, Some(1));
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::DumpProcess);
        assert!(error.message.contains("connection lost"));

        let artifact = result.artifact.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Partial);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"half");
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn timeout_discards_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let result = sh("printf 'started'; sleep 5", Duration::from_millis(300))
            .run(&store)
            .await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
        assert!(result.artifact.is_none());
        assert_eq!(temp_files(dir.path()), 0);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    fn process_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // Field 3 is the state; a zombie has already been killed.
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_processes_started_by_a_wrapper() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let pid_file = dir.path().join("inner.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let started = std::time::Instant::now();
        let result = sh(&script, Duration::from_millis(500)).run(&store).await;

        assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        let mut gone = false;
        for _ in 0..50 {
            if process_gone(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "inner sleep {pid} survived the timeout");
    }

    #[tokio::test]
    async fn empty_output_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let result = sh("true", Duration::from_secs(10)).run(&store).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.error.unwrap().kind, ErrorKind::EmptyDump);
        assert!(store.list_all().unwrap().is_empty());
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn missing_program_is_a_dump_failure() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let runner = DumpRunner::new(
            DumpCommand::new("definitely-not-a-real-dump-tool", Vec::<String>::new()),
            Duration::from_secs(10),
        );
        let result = runner.run(&store).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::DumpProcess);
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn large_output_streams_through() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        // ~1 MiB, several chunks
        let result = sh("head -c 1048576 /dev/zero", Duration::from_secs(20))
            .run(&store)
            .await;
        assert_eq!(result.bytes_written, 1_048_576);
        let artifact = result.artifact.unwrap();
        store.verify(&artifact.identifier).unwrap();
    }
}
