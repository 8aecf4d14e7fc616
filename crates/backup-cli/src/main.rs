mod cmd;
mod output;
mod root;

use backup_core::report::format_log_line;
use backup_core::BackupError;
use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "backup",
    about = "Scheduled database dumps with count- and age-based retention",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: nearest backup.yaml walking up from the working directory)
    #[arg(long, global = true, env = "BACKUP_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the database into a new artifact, then apply retention
    Run,

    /// List finalized artifacts, newest first
    List,

    /// Apply retention without dumping
    Prune {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-hash artifacts and compare with their recorded checksum
    Verify {
        /// Artifact identifier (omit to verify all)
        identifier: Option<String>,
    },

    /// Delete one artifact regardless of retention
    Delete { identifier: String },

    /// Inspect and validate configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG replaces the default outright.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = root::resolve_config(cli.config.as_deref());
    let config = config.as_deref();

    let result = match cli.command {
        Commands::Run => cmd::run::run(config, cli.json),
        Commands::List => cmd::list::run(config, cli.json),
        Commands::Prune { dry_run } => cmd::prune::run(config, dry_run, cli.json),
        Commands::Verify { identifier } => cmd::verify::run(config, identifier.as_deref(), cli.json),
        Commands::Delete { identifier } => cmd::delete::run(config, &identifier, cli.json),
        Commands::Config { subcommand } => cmd::config::run(config, subcommand, cli.json),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let code = exit_code_for(&e);
            let status = if code == 2 { "CONFIG_ERROR" } else { "ERROR" };
            eprintln!("{}", format_log_line(chrono::Utc::now(), status, &format!("{e:#}")));
            std::process::exit(code);
        }
    }
}

/// 2 for configuration problems, 1 for everything else.
fn exit_code_for(e: &anyhow::Error) -> i32 {
    let is_config = e
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<BackupError>(), Some(BackupError::Config(_))));
    if is_config {
        2
    } else {
        1
    }
}
