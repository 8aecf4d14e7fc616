//! On-disk artifact storage.
//!
//! Layout under the destination root:
//!
//! ```text
//! <id>.sql.tmp     in-progress dump, owned by exactly one ArtifactWriter
//! <id>.sql         finalized dump
//! <id>.meta.yaml   sidecar (checksum, size, status); its presence is what
//!                  makes an artifact visible to `list()`
//! ```
//!
//! The sidecar is written only after the data file has been renamed into
//! place, so listings never include a temporary file.

use crate::artifact::Artifact;
use crate::error::{BackupError, Result};
use crate::io;
use crate::paths;
use crate::types::ArtifactStatus;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if necessary) the destination directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        io::ensure_dir(&root).map_err(|e| {
            BackupError::Storage(format!("cannot create {}: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire a writable sink for a new artifact created at `created_at`.
    ///
    /// The identifier is derived from the timestamp; if it is already taken
    /// the timestamp is advanced one millisecond at a time until a free slot
    /// is found, so identifier order always matches creation order.
    pub async fn begin_write(&self, created_at: DateTime<Utc>) -> Result<ArtifactWriter> {
        let mut at = created_at;
        loop {
            let id = paths::format_identifier(at);
            if self.is_taken(&id) {
                at += chrono::Duration::milliseconds(1);
                continue;
            }
            let tmp = paths::temp_path(&self.root, &id);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)
                .await
            {
                Ok(file) => {
                    tracing::debug!(identifier = %id, "opened artifact sink");
                    return Ok(ArtifactWriter {
                        identifier: id,
                        root: self.root.clone(),
                        created_at: at,
                        file: Some(file),
                        hasher: Sha256::new(),
                        bytes: 0,
                        finished: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    at += chrono::Duration::milliseconds(1);
                }
                Err(e) => {
                    return Err(BackupError::Storage(format!(
                        "cannot create {}: {e}",
                        tmp.display()
                    )))
                }
            }
        }
    }

    fn is_taken(&self, id: &str) -> bool {
        paths::artifact_path(&self.root, id).exists()
            || paths::temp_path(&self.root, id).exists()
            || paths::meta_path(&self.root, id).exists()
    }

    /// Finalized artifacts, newest first. Sidecars are read lazily as the
    /// listing is iterated; call `list()` again to restart from a fresh scan.
    pub fn list(&self) -> Result<ArtifactListing> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(paths::identifier_from_meta_name) {
                ids.push(id.to_string());
            }
        }
        // Identifiers are timestamp-prefixed: lexical order is creation order,
        // and it breaks ties between equal timestamps deterministically.
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ArtifactListing {
            root: self.root.clone(),
            ids: ids.into_iter(),
        })
    }

    /// Convenience: collect `list()` into a vector.
    pub fn list_all(&self) -> Result<Vec<Artifact>> {
        self.list()?.collect()
    }

    pub fn get(&self, id: &str) -> Result<Artifact> {
        paths::validate_identifier(id)?;
        Artifact::load(&self.root, id)
    }

    /// Change an artifact's status. Refuses to mark `complete` an artifact
    /// that is empty or has no checksum.
    pub fn mark(&self, id: &str, status: ArtifactStatus) -> Result<Artifact> {
        let mut artifact = self.get(id)?;
        artifact.check_status(status)?;
        artifact.status = status;
        artifact.save(&self.root)?;
        Ok(artifact)
    }

    /// Remove an artifact and its sidecar.
    ///
    /// Returns `NotFound` when nothing is left to delete, so repeating a
    /// delete reports the same outcome without touching the store.
    pub fn delete(&self, id: &str) -> Result<()> {
        paths::validate_identifier(id)?;
        let meta = paths::meta_path(&self.root, id);
        let data = paths::artifact_path(&self.root, id);

        if !meta.exists() && !data.exists() {
            return Err(BackupError::NotFound(id.to_string()));
        }
        // Sidecar first: once it is gone the artifact is no longer listed,
        // even if removing the data file fails below.
        remove_if_present(&meta)?;
        remove_if_present(&data)?;
        tracing::info!(identifier = %id, "deleted artifact");
        Ok(())
    }

    /// Re-hash a finalized artifact and compare against its sidecar.
    pub fn verify(&self, id: &str) -> Result<Artifact> {
        let artifact = self.get(id)?;
        let expected = artifact.checksum.clone().ok_or_else(|| {
            BackupError::Storage(format!("{id} has no recorded checksum"))
        })?;
        let (actual, size) = io::sha256_file(&artifact.path)?;
        if actual != expected || size != artifact.size_bytes {
            return Err(BackupError::ChecksumMismatch {
                identifier: id.to_string(),
                expected: format!("{expected} ({} bytes)", artifact.size_bytes),
                actual: format!("{actual} ({size} bytes)"),
            });
        }
        Ok(artifact)
    }

    /// Remove what a process that died mid-write left behind: `.tmp` files,
    /// and data files renamed into place whose sidecar was never written.
    /// Only safe while holding the run lock.
    pub fn sweep_temporaries(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let orphaned = if name.ends_with(paths::TEMP_SUFFIX) {
                true
            } else if let Some(id) = paths::identifier_from_artifact_name(name) {
                !paths::meta_path(&self.root, id).exists()
            } else {
                false
            };
            if orphaned {
                remove_if_present(&path)?;
                tracing::warn!(path = %path.display(), "removed orphaned file");
                removed.push(path);
            }
        }
        Ok(removed)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::Storage(format!(
            "cannot remove {}: {e}",
            path.display()
        ))),
    }
}

// ---------------------------------------------------------------------------
// ArtifactListing
// ---------------------------------------------------------------------------

/// Lazy, newest-first iterator over finalized artifacts.
#[derive(Debug)]
pub struct ArtifactListing {
    root: PathBuf,
    ids: std::vec::IntoIter<String>,
}

impl Iterator for ArtifactListing {
    type Item = Result<Artifact>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.ids.next()?;
            match Artifact::load(&self.root, &id) {
                // Deleted between the scan and this read.
                Err(BackupError::NotFound(_)) => continue,
                other => return Some(other),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len()))
    }
}

// ---------------------------------------------------------------------------
// ArtifactWriter
// ---------------------------------------------------------------------------

/// Scoped sink for one artifact.
///
/// Bytes are hashed as they are written. `commit` renames the temporary file
/// into place and writes the sidecar; `discard`, or dropping the writer
/// without committing (error paths, timeouts, task cancellation), removes the
/// temporary file.
#[derive(Debug)]
pub struct ArtifactWriter {
    identifier: String,
    root: PathBuf,
    created_at: DateTime<Utc>,
    file: Option<tokio::fs::File>,
    hasher: Sha256,
    bytes: u64,
    finished: bool,
}

impl ArtifactWriter {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn temp_path(&self) -> PathBuf {
        paths::temp_path(&self.root, &self.identifier)
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BackupError::Storage("artifact sink already closed".into()))?;
        file.write_all(chunk).await.map_err(|e| {
            BackupError::Storage(format!("writing {}: {e}", self.identifier))
        })?;
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    /// Finalize the artifact with `status`. On error the writer is dropped
    /// and the temporary file removed.
    pub async fn commit(
        mut self,
        status: ArtifactStatus,
        exit_code: Option<i32>,
    ) -> Result<Artifact> {
        let artifact = Artifact {
            identifier: self.identifier.clone(),
            path: paths::artifact_path(&self.root, &self.identifier),
            size_bytes: self.bytes,
            created_at: self.created_at,
            checksum: Some(format!("{:x}", self.hasher.clone().finalize())),
            status,
            exit_code,
        };
        artifact.check_status(status)?;

        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await.map_err(|e| {
                BackupError::Storage(format!("syncing {}: {e}", self.identifier))
            })?;
        }

        let tmp = self.temp_path();
        tokio::fs::rename(&tmp, &artifact.path).await.map_err(|e| {
            BackupError::Storage(format!(
                "renaming {} into place: {e}",
                tmp.display()
            ))
        })?;

        if let Err(e) = artifact.save(&self.root) {
            // Without a sidecar the data file would be invisible; don't leave it.
            let _ = std::fs::remove_file(&artifact.path);
            return Err(BackupError::Storage(format!(
                "writing metadata for {}: {e}",
                self.identifier
            )));
        }

        self.finished = true;
        tracing::info!(
            identifier = %artifact.identifier,
            bytes = artifact.size_bytes,
            status = %artifact.status,
            "finalized artifact"
        );
        Ok(artifact)
    }

    /// Abandon the artifact and remove its temporary file.
    pub async fn discard(mut self) -> Result<()> {
        self.finished = true;
        self.file.take();
        match tokio::fs::remove_file(self.temp_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::Storage(format!(
                "removing {}: {e}",
                self.temp_path().display()
            ))),
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.file.take();
        let tmp = self.temp_path();
        match std::fs::remove_file(&tmp) {
            Ok(()) => {
                tracing::debug!(identifier = %self.identifier, "removed unfinished artifact")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %tmp.display(),
                error = %e,
                "failed to remove unfinished artifact"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
