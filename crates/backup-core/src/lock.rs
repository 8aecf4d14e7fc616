use crate::error::{BackupError, Result};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Exclusive run lock in the destination root, held for the lifetime of the
/// value. Guards against overlapping invocations from separate processes
/// (e.g. a cron job firing while the previous run is still going).
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock, reclaiming it if the holder started more than
    /// `stale_after` ago.
    pub fn acquire(root: &Path, stale_after: chrono::Duration) -> Result<Self> {
        let path = paths::lock_path(root);
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => return Self::claim(path, &mut file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = Self::read_info(&path);
                    if !is_stale(&path, holder.as_ref(), stale_after) {
                        return Err(BackupError::AlreadyRunning(describe(holder.as_ref())));
                    }
                    reclaim(&path, stale_after)?;
                }
                Err(e) => {
                    return Err(BackupError::Storage(format!(
                        "cannot create {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Err(BackupError::AlreadyRunning(
            "lock was re-acquired by another process".into(),
        ))
    }

    /// Record this process as holder of the freshly created lock file. A
    /// file that cannot be written is removed again instead of blocking later
    /// runs until it turns stale.
    fn claim(path: PathBuf, file: &mut impl Write) -> Result<Self> {
        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        let written = serde_yaml::to_string(&info)
            .map_err(BackupError::from)
            .and_then(|yaml| file.write_all(yaml.as_bytes()).map_err(BackupError::from));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok(Self { path })
    }

    /// Current holder, if the lock file exists and is readable.
    pub fn read_info(path: &Path) -> Option<LockInfo> {
        let data = std::fs::read_to_string(path).ok()?;
        serde_yaml::from_str(&data).ok()
    }
}

/// Move a stale lock aside and delete it.
///
/// The rename is atomic, so of several processes racing to reclaim, only one
/// moves any given file. Staleness is re-checked on the moved file: if another
/// process had already replaced the stale lock with a fresh one, that fresh
/// lock is put back and the caller backs off.
fn reclaim(path: &Path, stale_after: chrono::Duration) -> Result<()> {
    let aside = path.with_extension(format!(
        "lock.stale.{}.{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        // Someone else reclaimed it first; retry create_new.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let holder = RunLock::read_info(&aside);
    if is_stale(&aside, holder.as_ref(), stale_after) {
        tracing::warn!(
            holder = %describe(holder.as_ref()),
            "reclaiming stale run lock"
        );
        std::fs::remove_file(&aside)?;
        return Ok(());
    }

    // Fresh lock moved by mistake: restore it unless yet another one exists.
    let restored = std::fs::hard_link(&aside, path);
    let _ = std::fs::remove_file(&aside);
    if let Err(e) = restored {
        tracing::warn!(error = %e, "could not restore run lock");
    }
    Err(BackupError::AlreadyRunning(describe(holder.as_ref())))
}

fn is_stale(path: &Path, holder: Option<&LockInfo>, stale_after: chrono::Duration) -> bool {
    lock_started_at(path, holder).is_some_and(|at| Utc::now() - at > stale_after)
}

/// When the holder took the lock. Falls back to the file's mtime while the
/// holder has created the file but not yet written its info.
fn lock_started_at(path: &Path, holder: Option<&LockInfo>) -> Option<DateTime<Utc>> {
    if let Some(h) = holder {
        return Some(h.started_at);
    }
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

fn describe(holder: Option<&LockInfo>) -> String {
    match holder {
        Some(h) => format!("pid {} since {}", h.pid, h.started_at.to_rfc3339()),
        None => "unknown holder".to_string(),
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}
