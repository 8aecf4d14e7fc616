use crate::error::{BackupError, Result};
use crate::paths;
use crate::types::ArtifactStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// One finalized backup file plus the metadata recorded in its sidecar.
///
/// A `complete` artifact always carries a checksum and a non-zero size; the
/// store refuses to persist one that doesn't.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub identifier: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub status: ArtifactStatus,
    /// Exit code of the dump process that produced this artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Artifact {
    pub fn is_complete(&self) -> bool {
        self.status == ArtifactStatus::Complete
    }

    /// Check the `complete` invariant for a prospective status.
    pub(crate) fn check_status(&self, status: ArtifactStatus) -> Result<()> {
        if status != ArtifactStatus::Complete {
            return Ok(());
        }
        if self.size_bytes == 0 {
            return Err(BackupError::Storage(format!(
                "{} is empty and cannot be marked complete",
                self.identifier
            )));
        }
        if self.checksum.as_deref().map_or(true, str::is_empty) {
            return Err(BackupError::Storage(format!(
                "{} has no checksum and cannot be marked complete",
                self.identifier
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sidecar persistence
    // -----------------------------------------------------------------------

    pub(crate) fn load(root: &Path, id: &str) -> Result<Self> {
        let path = paths::meta_path(root, id);
        if !path.exists() {
            return Err(BackupError::NotFound(id.to_string()));
        }
        let data = std::fs::read_to_string(&path)?;
        let meta: ArtifactMeta = serde_yaml::from_str(&data)?;
        Ok(meta.into_artifact(root))
    }

    pub(crate) fn save(&self, root: &Path) -> Result<()> {
        crate::io::write_yaml_atomic(
            &paths::meta_path(root, &self.identifier),
            &ArtifactMeta::from(self),
        )
    }
}

// ---------------------------------------------------------------------------
// ArtifactMeta (sidecar file format)
// ---------------------------------------------------------------------------

/// On-disk form of an artifact. The data path is derived from the identifier
/// so a moved destination directory stays readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactMeta {
    identifier: String,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
    status: ArtifactStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

impl ArtifactMeta {
    fn into_artifact(self, root: &Path) -> Artifact {
        Artifact {
            path: paths::artifact_path(root, &self.identifier),
            identifier: self.identifier,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            checksum: self.checksum,
            status: self.status,
            exit_code: self.exit_code,
        }
    }
}

impl From<&Artifact> for ArtifactMeta {
    fn from(a: &Artifact) -> Self {
        Self {
            identifier: a.identifier.clone(),
            size_bytes: a.size_bytes,
            created_at: a.created_at,
            checksum: a.checksum.clone(),
            status: a.status,
            exit_code: a.exit_code,
        }
    }
}
