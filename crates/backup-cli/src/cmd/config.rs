use crate::cmd::load_config;
use crate::output::print_json;
use backup_core::config::WarnLevel;
use backup_core::BackupError;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration (file + defaults + environment)
    Show,

    /// Validate the configuration for common mistakes
    Validate,
}

pub fn run(config: Option<&Path>, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<i32> {
    match subcmd {
        ConfigSubcommand::Show => show(config, json),
        ConfigSubcommand::Validate => validate(config, json),
    }
}

fn show(config: Option<&Path>, json: bool) -> anyhow::Result<i32> {
    let cfg = load_config(config)?;
    if json {
        print_json(&cfg)?;
    } else {
        match config {
            Some(p) => println!("# source: {}", p.display()),
            None => println!("# source: defaults + environment"),
        }
        print!("{}", serde_yaml::to_string(&cfg)?);
    }
    Ok(0)
}

fn validate(config: Option<&Path>, json: bool) -> anyhow::Result<i32> {
    let cfg = load_config(config)?;
    let warnings = cfg.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();
    if errors > 0 {
        return Err(BackupError::Config(format!("validation found {errors} error(s)")).into());
    }
    Ok(0)
}
