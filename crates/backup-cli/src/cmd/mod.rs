pub mod config;
pub mod delete;
pub mod list;
pub mod prune;
pub mod run;
pub mod verify;

use anyhow::Context;
use backup_core::config::Config;
use backup_core::store::ArtifactStore;
use std::path::Path;

/// Load configuration without validating the dump command. Enough for
/// commands that only read or edit the destination directory.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let cfg = Config::load(path).context("failed to load configuration")?;
    tracing::debug!(
        config = ?path,
        destination = %cfg.destination.display(),
        "configuration loaded"
    );
    Ok(cfg)
}

pub fn open_store(cfg: &Config) -> anyhow::Result<ArtifactStore> {
    ArtifactStore::open(&cfg.destination)
        .with_context(|| format!("failed to open {}", cfg.destination.display()))
}
