use crate::error::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// File naming
// ---------------------------------------------------------------------------

pub const ARTIFACT_EXT: &str = "sql";
pub const TEMP_SUFFIX: &str = ".sql.tmp";
pub const META_SUFFIX: &str = ".meta.yaml";
pub const LOCK_FILE: &str = ".backup.lock";
pub const DEFAULT_CONFIG_FILE: &str = "backup.yaml";

/// Identifiers are UTC timestamps with millisecond precision, e.g.
/// `20261016T031500042Z`. Lexical order equals chronological order.
pub const IDENTIFIER_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn artifact_path(root: &Path, id: &str) -> PathBuf {
    root.join(format!("{id}.{ARTIFACT_EXT}"))
}

pub fn temp_path(root: &Path, id: &str) -> PathBuf {
    root.join(format!("{id}{TEMP_SUFFIX}"))
}

pub fn meta_path(root: &Path, id: &str) -> PathBuf {
    root.join(format!("{id}{META_SUFFIX}"))
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

static IDENTIFIER_RE: OnceLock<Regex> = OnceLock::new();

fn identifier_re() -> &'static Regex {
    IDENTIFIER_RE.get_or_init(|| Regex::new(r"^\d{8}T\d{9}Z$").unwrap())
}

pub fn format_identifier(at: DateTime<Utc>) -> String {
    at.format(IDENTIFIER_FORMAT).to_string()
}

pub fn validate_identifier(id: &str) -> Result<()> {
    if !identifier_re().is_match(id) || parse_identifier(id).is_none() {
        return Err(BackupError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}

/// Recover the timestamp encoded in an identifier.
pub fn parse_identifier(id: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(id, IDENTIFIER_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Extract the identifier from a finalized data file name, if it is one.
pub fn identifier_from_artifact_name(name: &str) -> Option<&str> {
    let id = name.strip_suffix(ARTIFACT_EXT)?.strip_suffix('.')?;
    identifier_re().is_match(id).then_some(id)
}

/// Extract the identifier from a sidecar file name, if it is one.
pub fn identifier_from_meta_name(name: &str) -> Option<&str> {
    let id = name.strip_suffix(META_SUFFIX)?;
    identifier_re().is_match(id).then_some(id)
}
