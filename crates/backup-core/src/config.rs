use crate::error::{BackupError, Result};
use crate::retention::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// DumpConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DumpConfig {
    /// Program to execute; resolved through `PATH` when not absolute.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the dump process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// RetentionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_max_count() -> usize {
    7
}

fn default_max_age_days() -> u32 {
    30
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            max_age_days: default_max_age_days(),
        }
    }
}

// ---------------------------------------------------------------------------
// NotifyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotifyConfig {
    /// Hook executed after every run with `BACKUP_STATUS` / `BACKUP_DETAIL` set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default = "default_destination")]
    pub destination: PathBuf,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "is_default_notify")]
    pub notify: NotifyConfig,
}

fn default_version() -> u32 {
    1
}

fn default_destination() -> PathBuf {
    PathBuf::from("backups")
}

fn default_timeout_seconds() -> u64 {
    3600
}

fn is_default_notify(n: &NotifyConfig) -> bool {
    *n == NotifyConfig::default()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            dump: DumpConfig::default(),
            destination: default_destination(),
            retention: RetentionConfig::default(),
            timeout_seconds: default_timeout_seconds(),
            log_file: None,
            notify: NotifyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or defaults when `None`), then apply
    /// `BACKUP_*` environment overrides from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Parse a YAML file. Relative `destination` and `log_file` paths are
    /// resolved against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut cfg: Config = serde_yaml::from_str(&data)
            .map_err(|e| BackupError::Config(format!("{}: {e}", path.display())))?;
        if let Some(base) = path.parent() {
            cfg.resolve_relative_to(base);
        }
        Ok(cfg)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.destination.is_relative() {
            self.destination = base.join(&self.destination);
        }
        if let Some(log) = &self.log_file {
            if log.is_relative() {
                self.log_file = Some(base.join(log));
            }
        }
    }

    /// Apply `BACKUP_*` overrides. `lookup` abstracts the environment so tests
    /// need not mutate process state.
    ///
    /// `BACKUP_DUMP_COMMAND` is split on whitespace: the first word is the
    /// program and the rest replace `dump.args`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cmdline) = lookup("BACKUP_DUMP_COMMAND") {
            let mut words = cmdline.split_whitespace().map(str::to_string);
            self.dump.command = words.next().unwrap_or_default();
            self.dump.args = words.collect();
        }
        if let Some(dest) = lookup("BACKUP_DESTINATION") {
            self.destination = PathBuf::from(dest);
        }
        if let Some(raw) = lookup("BACKUP_MAX_COUNT") {
            self.retention.max_count = parse_number("BACKUP_MAX_COUNT", &raw)?;
        }
        if let Some(raw) = lookup("BACKUP_MAX_AGE_DAYS") {
            self.retention.max_age_days = parse_number("BACKUP_MAX_AGE_DAYS", &raw)?;
        }
        if let Some(raw) = lookup("BACKUP_TIMEOUT_SECONDS") {
            self.timeout_seconds = parse_number("BACKUP_TIMEOUT_SECONDS", &raw)?;
        }
        if let Some(log) = lookup("BACKUP_LOG_FILE") {
            self.log_file = Some(PathBuf::from(log));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(
            self.retention.max_count,
            chrono::Duration::days(i64::from(self.retention.max_age_days)),
        )
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let command = self.dump.command.trim();
        if command.is_empty() {
            warnings.push(ConfigWarning::error(
                "dump.command is not set (use the config file or BACKUP_DUMP_COMMAND)",
            ));
        } else if which::which(command).is_err() {
            warnings.push(ConfigWarning::error(format!(
                "dump.command '{command}' was not found"
            )));
        }

        if self.destination.as_os_str().is_empty() {
            warnings.push(ConfigWarning::error("destination is empty"));
        }

        if self.retention.max_count == 0 {
            warnings.push(ConfigWarning::error(
                "retention.max_count must be at least 1",
            ));
        } else if self.retention.max_count > 365 {
            warnings.push(ConfigWarning::warning(format!(
                "retention.max_count={} (>365 is unusual)",
                self.retention.max_count
            )));
        }

        if self.retention.max_age_days == 0 {
            warnings.push(ConfigWarning::error(
                "retention.max_age_days must be at least 1",
            ));
        }

        if self.timeout_seconds == 0 {
            warnings.push(ConfigWarning::error("timeout_seconds must be at least 1"));
        } else if self.timeout_seconds > 24 * 3600 {
            warnings.push(ConfigWarning::warning(format!(
                "timeout_seconds={} exceeds one day",
                self.timeout_seconds
            )));
        }

        if let Some(hook) = &self.notify.command {
            if which::which(hook.trim()).is_err() {
                warnings.push(ConfigWarning::warning(format!(
                    "notify.command '{hook}' was not found"
                )));
            }
        }

        warnings
    }

    /// Fail with `BackupError::Config` when validation reports any error.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BackupError::Config(errors.join("; ")))
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| BackupError::Config(format!("{key}='{raw}' is not a valid number")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
