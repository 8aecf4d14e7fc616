use backup_core::paths::DEFAULT_CONFIG_FILE;
use std::path::{Path, PathBuf};

/// Resolve the configuration file.
///
/// Priority:
/// 1. `--config` flag / `BACKUP_CONFIG` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `backup.yaml`
/// 3. None: defaults plus `BACKUP_*` environment overrides only
pub fn resolve_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    let cwd = std::env::current_dir().ok()?;
    find_upward(&cwd, DEFAULT_CONFIG_FILE)
}

fn find_upward(start: &Path, name: &str) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => return None,
        }
    }
}
