//! Host Backup Library
//!
//! Host-scoped backups into timestamped generations, hard-linked against
//! the previous generation between full runs, with thinning retention.

pub mod catalog;
pub mod config;
pub mod executor;
pub mod fs;
pub mod planner;
pub mod reconcile;
pub mod retention;
pub mod run;
pub mod shutdown;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, HostConfig};
pub use run::{run_backup, RunContext, RunOptions, RunReport};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
