//! Coordination of a single backup invocation.
//!
//! Lifecycle: `idle -> running -> {succeeded, failed} -> pruning -> done -> idle`.
//! Retention runs after failed dumps too, so stale backups do not pile up
//! while the dump keeps failing.

use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::lock::RunLock;
use crate::report::{BackupReport, PruneFailure, PruneReport};
use crate::retention::RetentionPolicy;
use crate::runner::{DumpCommand, DumpRunner};
use crate::store::ArtifactStore;
use crate::types::RunState;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Extra slack on top of the dump timeout before a lock file is considered
/// abandoned by a crashed process.
const LOCK_GRACE_SECS: i64 = 300;
const MAX_LOCK_SECS: i64 = 365 * 24 * 3600;

#[derive(Debug)]
pub struct BackupOrchestrator {
    store: ArtifactStore,
    runner: DumpRunner,
    policy: RetentionPolicy,
    state: Mutex<RunState>,
    lock_stale_after: chrono::Duration,
}

impl BackupOrchestrator {
    pub fn new(store: ArtifactStore, runner: DumpRunner, policy: RetentionPolicy) -> Self {
        let timeout_secs = i64::try_from(runner.timeout().as_secs())
            .unwrap_or(i64::MAX)
            .min(MAX_LOCK_SECS);
        Self {
            store,
            runner,
            policy,
            state: Mutex::new(RunState::Idle),
            lock_stale_after: chrono::Duration::seconds(timeout_secs.saturating_add(LOCK_GRACE_SECS)),
        }
    }

    /// Validate `cfg` and open its destination. Nothing is touched on disk
    /// unless validation passes.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        cfg.ensure_valid()?;
        let store = ArtifactStore::open(&cfg.destination)?;
        let runner = DumpRunner::new(DumpCommand::from(&cfg.dump), cfg.timeout());
        Ok(Self::new(store, runner, cfg.retention_policy()))
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dump once, then apply retention.
    ///
    /// Returns `Err` only when the run could not start (`AlreadyRunning`, or
    /// the run lock could not be created). Dump and prune failures are
    /// reported inside the `BackupReport`.
    pub async fn run(&self) -> Result<BackupReport> {
        let mut guard = StateGuard::begin(&self.state, RunState::Running)?;
        let _lock = RunLock::acquire(self.store.root(), self.lock_stale_after)?;

        if let Err(e) = self.store.sweep_temporaries() {
            tracing::warn!(error = %e, "could not sweep temporary files");
        }

        let run = self.runner.run(&self.store).await;
        guard.advance(if run.succeeded() {
            RunState::Succeeded
        } else {
            RunState::Failed
        });

        guard.advance(RunState::Pruning);
        let prune = self.apply_retention(Utc::now(), false);
        guard.advance(RunState::Done);

        let report = BackupReport { run, prune };
        tracing::info!(
            status = report.status_label(),
            bytes = report.run.bytes_written,
            pruned = report.prune.deleted.len(),
            "backup run finished"
        );
        Ok(report)
    }

    /// Apply retention without dumping. With `dry_run` nothing is deleted.
    pub fn prune(&self, dry_run: bool) -> Result<PruneReport> {
        let mut guard = StateGuard::begin(&self.state, RunState::Pruning)?;
        let _lock = RunLock::acquire(self.store.root(), self.lock_stale_after)?;
        let report = self.apply_retention(Utc::now(), dry_run);
        guard.advance(RunState::Done);
        Ok(report)
    }

    fn apply_retention(&self, now: DateTime<Utc>, dry_run: bool) -> PruneReport {
        let mut report = PruneReport {
            dry_run,
            ..Default::default()
        };

        let artifacts = match self.store.list_all() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "could not list artifacts for pruning");
                report.failures.push(PruneFailure {
                    identifier: self.store.root().display().to_string(),
                    message: e.to_string(),
                });
                return report;
            }
        };

        // Newest first, matching the listing order.
        report.selected = self
            .policy
            .select_for_deletion(&artifacts, now)
            .into_iter()
            .rev()
            .collect();

        if dry_run {
            return report;
        }

        for id in &report.selected {
            match self.store.delete(id) {
                Ok(()) => report.deleted.push(id.clone()),
                Err(BackupError::NotFound(_)) => {
                    tracing::debug!(identifier = %id, "already gone");
                }
                Err(e) => {
                    tracing::warn!(identifier = %id, error = %e, "failed to prune artifact");
                    report.failures.push(PruneFailure {
                        identifier: id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

// ---------------------------------------------------------------------------
// StateGuard
// ---------------------------------------------------------------------------

/// Holds the orchestrator out of `idle` for the duration of one invocation
/// and returns it to `idle` on every exit path, including a dropped future.
struct StateGuard<'a> {
    state: &'a Mutex<RunState>,
}

impl<'a> StateGuard<'a> {
    fn begin(state: &'a Mutex<RunState>, to: RunState) -> Result<Self> {
        let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != RunState::Idle {
            return Err(BackupError::AlreadyRunning(format!(
                "orchestrator is {}",
                *current
            )));
        }
        *current = to;
        tracing::debug!(state = %to, "orchestrator state");
        Ok(Self { state })
    }

    fn advance(&mut self, to: RunState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(
            current.can_transition_to(to),
            "invalid transition {} -> {}",
            *current,
            to
        );
        *current = to;
        tracing::debug!(state = %to, "orchestrator state");
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *current = RunState::Idle;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths;
    use crate::types::{ArtifactStatus, ErrorKind, RunStatus};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn orchestrator(root: &std::path::Path, script: &str, timeout: Duration, max_count: usize) -> BackupOrchestrator {
        let store = ArtifactStore::open(root).unwrap();
        let runner = DumpRunner::new(DumpCommand::new("sh", ["-c", script]), timeout);
        BackupOrchestrator::new(
            store,
            runner,
            RetentionPolicy::new(max_count, chrono::Duration::days(30)),
        )
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
    async fn ten_runs_keep_the_seven_most_recent() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), "printf 'dump'", Duration::from_secs(10), 7);

        let mut produced = Vec::new();
        for _ in 0..10 {
            let report = orch.run().await.unwrap();
            assert_eq!(report.exit_code(), 0);
            produced.push(report.run.artifact.unwrap().identifier);
            assert!(orch.store().list_all().unwrap().len() <= 7);
        }

        let listed: Vec<String> = orch
            .store()
            .list_all()
            .unwrap()
            .into_iter()
            .map(|a| a.identifier)
            .collect();
        let expected: Vec<String> = produced.iter().rev().take(7).cloned().collect();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn failed_dump_still_prunes() {
        let dir = TempDir::new().unwrap();
        let good = orchestrator(dir.path(), "printf 'ok'", Duration::from_secs(10), 1);
        good.run().await.unwrap();
        // Second complete artifact; count rule (max 1) prunes the first.
        good.run().await.unwrap();
        assert_eq!(good.store().list_all().unwrap().len(), 1);

        let dir2 = TempDir::new().unwrap();
        let seed = orchestrator(dir2.path(), "printf 'ok'", Duration::from_secs(10), 5);
        seed.run().await.unwrap();
        seed.run().await.unwrap();
        assert_eq!(seed.store().list_all().unwrap().len(), 2);

        let failing = orchestrator(dir2.path(), "printf 'half'; exit 1", Duration::from_secs(10), 1);
        let report = failing.run().await.unwrap();

        assert_eq!(report.run.status, RunStatus::Failed);
        assert_eq!(report.run.error.as_ref().unwrap().kind, ErrorKind::DumpProcess);
        assert_eq!(
            report.run.artifact.as_ref().unwrap().status,
            ArtifactStatus::Partial
        );
        assert_eq!(report.prune.deleted.len(), 1);
        assert_eq!(report.exit_code(), 1);

        let listed = failing.store().list_all().unwrap();
        let complete = listed.iter().filter(|a| a.is_complete()).count();
        let partial = listed
            .iter()
            .filter(|a| a.status == ArtifactStatus::Partial)
            .count();
        assert_eq!(complete, 1);
        assert_eq!(partial, 1);
    }

    #[tokio::test]
    async fn timeout_leaves_consistent_store() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), "printf 'x'; sleep 5", Duration::from_millis(300), 7);
        let report = orch.run().await.unwrap();

        assert_eq!(report.run.error.unwrap().kind, ErrorKind::Timeout);
        assert!(orch
            .store()
            .list_all()
            .unwrap()
            .iter()
            .all(|a| !a.is_complete()));
        assert_eq!(temp_files(dir.path()), 0);
        assert!(!paths::lock_path(dir.path()).exists());
        assert_eq!(orch.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn concurrent_invocation_is_rejected() {
        let dir = TempDir::new().unwrap();
        let orch = Arc::new(orchestrator(
            dir.path(),
            "sleep 1; printf 'slow'",
            Duration::from_secs(10),
            7,
        ));

        let first = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.run().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(orch.state(), RunState::Running);

        let second = orch.run().await;
        assert!(matches!(second, Err(BackupError::AlreadyRunning(_))));
        assert!(matches!(orch.prune(false), Err(BackupError::AlreadyRunning(_))));

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.run.status, RunStatus::Succeeded);
        assert_eq!(orch.state(), RunState::Idle);
        assert_eq!(orch.store().list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lock_held_by_another_process_is_rejected() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), "printf 'x'", Duration::from_secs(10), 7);
        let _other = RunLock::acquire(dir.path(), chrono::Duration::hours(1)).unwrap();

        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, BackupError::AlreadyRunning(_)));
        assert_eq!(orch.state(), RunState::Idle);
        assert!(orch.store().list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let seed = orchestrator(dir.path(), "printf 'x'", Duration::from_secs(10), 10);
        for _ in 0..5 {
            seed.run().await.unwrap();
        }

        let tight = orchestrator(dir.path(), "printf 'x'", Duration::from_secs(10), 2);
        let first = tight.prune(false).unwrap();
        assert_eq!(first.deleted.len(), 3);
        let second = tight.prune(false).unwrap();
        assert!(second.selected.is_empty());
        assert!(second.deleted.is_empty());
        assert_eq!(tight.store().list_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_deletion_is_collected_and_pruning_continues() {
        let dir = TempDir::new().unwrap();
        let seed = orchestrator(dir.path(), "printf 'x'", Duration::from_secs(10), 10);
        for _ in 0..3 {
            seed.run().await.unwrap();
        }
        let listed = seed.store().list_all().unwrap();
        let (newest, middle, oldest) = (&listed[0], &listed[1], &listed[2]);

        // A non-empty directory where the data file should be cannot be unlinked.
        std::fs::remove_file(&oldest.path).unwrap();
        std::fs::create_dir(&oldest.path).unwrap();
        std::fs::write(oldest.path.join("blocker"), b"x").unwrap();

        let tight = orchestrator(dir.path(), "printf 'x'", Duration::from_secs(10), 1);
        let report = tight.prune(false).unwrap();

        assert_eq!(report.selected, vec![middle.identifier.clone(), oldest.identifier.clone()]);
        assert_eq!(report.deleted, vec![middle.identifier.clone()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].identifier, oldest.identifier);
        assert!(!report.is_clean());
        assert_eq!(report.exit_code(), 1);
        assert!(!middle.path.exists());
        assert!(newest.path.exists());
    }

    #[tokio::test]
    async fn dry_run_deletes_nothing() {
        let dir = TempDir::new().unwrap();
        let seed = orchestrator(dir.path(), "printf 'x'", Duration::from_secs(10), 10);
        for _ in 0..3 {
            seed.run().await.unwrap();
        }
        let tight = orchestrator(dir.path(), "printf 'x'", Duration::from_secs(10), 1);
        let report = tight.prune(true).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.selected.len(), 2);
        assert!(report.deleted.is_empty());
        assert_eq!(tight.store().list_all().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn orphaned_temporaries_are_swept_before_dumping() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), "printf 'x'", Duration::from_secs(10), 7);
        std::fs::write(dir.path().join("20200101T000000000Z.sql.tmp"), b"crashed").unwrap();
        orch.run().await.unwrap();
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[test]
    fn invalid_config_has_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.destination = dir.path().join("never-created");
        let err = BackupOrchestrator::from_config(&cfg).unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
        assert!(!cfg.destination.exists());
    }

    #[test]
    fn from_config_opens_destination() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.dump.command = "sh".into();
        cfg.destination = dir.path().join("out");
        cfg.retention.max_count = 3;
        let orch = BackupOrchestrator::from_config(&cfg).unwrap();
        assert!(cfg.destination.is_dir());
        assert_eq!(orch.policy().max_count, 3);
        assert_eq!(orch.state(), RunState::Idle);
    }
}
