pub mod artifact;
pub mod config;
pub mod error;
pub mod io;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod paths;
pub mod report;
pub mod retention;
pub mod runner;
pub mod store;
pub mod types;

pub use error::{BackupError, Result};
