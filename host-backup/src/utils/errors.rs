//! Custom error types for the backup runner.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Host '{host}' is not configured in '{}'", config.display())]
    HostNotConfigured { host: String, config: PathBuf },

    #[error("Host '{host}' max_tail ({max_tail}) is too large for max_backups ({max_backups})")]
    TailTooLarge {
        host: String,
        max_tail: usize,
        max_backups: usize,
    },

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("No transfer options found for {src_kind} -> {dst_kind} (source '{}')", source_path.display())]
    NoTransferOptions {
        src_kind: String,
        dst_kind: String,
        source_path: PathBuf,
    },

    #[error("Required user is '{required}' but running as '{actual}'")]
    IdentityMismatch { required: String, actual: String },

    #[error("Generation {timestamp} is not newer than existing generation {newest}")]
    TimestampNotIncreasing { timestamp: String, newest: String },

    #[error("Incremental backup of '{dataset}' has no prior generation to link against; run with --full")]
    MissingBaseline { dataset: String },

    #[error("Failed to start transfer program '{program}': {source}")]
    TransferSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer of '{dataset}' failed: {status}")]
    TransferFailed { dataset: String, status: String },

    #[error("Backup cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BackupError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::IdentityMismatch { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
