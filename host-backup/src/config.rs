//! Configuration management for the backup runner.
//!
//! A single file (YAML, or TOML when the extension says so) holds global
//! settings plus a `hosts` map. Each host may override any global key; the
//! merged, validated result for the running machine is a [`HostConfig`].

use crate::retention::{RetentionMode, RetentionPolicy};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Base name of the configuration file looked up next to the executable.
pub const DEFAULT_CONFIG_STEM: &str = "host-backup";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// User the backup must run as
    #[serde(default = "default_uid")]
    pub uid: String,

    /// Root of all generations; a `/<host>` component is appended
    #[serde(default = "default_target_dir")]
    pub target_dir: PathBuf,

    /// Patterns passed to the transfer tool as `--exclude`
    #[serde(default)]
    pub excludes: Vec<String>,

    /// Transfer flags keyed by (source, destination) filesystem kinds
    #[serde(default)]
    pub rsync_opt_map: Vec<TransferOptionRule>,

    /// Generations kept after retention
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Full backup cadence
    #[serde(default = "default_max_partials")]
    pub max_partials: u64,

    /// Thinning stride
    #[serde(default = "default_max_tail")]
    pub max_tail: usize,

    #[serde(default)]
    pub logs: LogConfig,

    /// Transfer executable
    #[serde(default = "default_transfer_program")]
    pub transfer_program: String,

    #[serde(default)]
    pub retention: RetentionMode,

    #[serde(default)]
    pub hosts: BTreeMap<String, HostEntry>,
}

/// Per-host section. Unset keys fall back to the global value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostEntry {
    #[serde(default)]
    pub data: Vec<DataSet>,

    pub uid: Option<String>,
    pub target_dir: Option<PathBuf>,
    pub excludes: Option<Vec<String>>,
    pub rsync_opt_map: Option<Vec<TransferOptionRule>>,
    pub max_backups: Option<usize>,
    pub max_partials: Option<u64>,
    pub max_tail: Option<usize>,
    pub logs: Option<LogConfig>,
    pub transfer_program: Option<String>,
    pub retention: Option<RetentionMode>,
}

/// A directory tree to back up and the name it gets inside each generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSet {
    pub src: PathBuf,
    pub dst: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptionRule {
    #[serde(default)]
    pub src_fs_type: Vec<String>,

    #[serde(default)]
    pub dst_fs_type: Vec<String>,

    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Run log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Run log directory; a `/<host>` component is appended
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

// Default values
fn default_uid() -> String {
    "root".to_string()
}

fn default_target_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_max_backups() -> usize {
    4
}

fn default_max_partials() -> u64 {
    4
}

fn default_max_tail() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("bk_logs")
}

fn default_transfer_program() -> String {
    "rsync".to_string()
}

/// Fully resolved settings for one host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host: String,
    pub uid: String,
    pub target_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub data: Vec<DataSet>,
    pub excludes: Vec<String>,
    pub rsync_opt_map: Vec<TransferOptionRule>,
    pub max_partials: u64,
    pub retention: RetentionPolicy,
    pub transfer_program: String,
}

impl Config {
    /// Load configuration from a YAML or TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let config = if is_toml {
            toml::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        Ok(config)
    }

    /// Find the configured host name for a machine hostname, trying the
    /// full name first and then the short name.
    pub fn resolve_host_name(&self, hostname: &str) -> Option<String> {
        if self.hosts.contains_key(hostname) {
            return Some(hostname.to_string());
        }
        let short = hostname.split('.').next()?;
        self.hosts.contains_key(short).then(|| short.to_string())
    }

    /// Merge global settings into a host's section and validate the result.
    ///
    /// Relative directories are resolved against `base_dir`.
    pub fn for_host(&self, host: &str, base_dir: &Path, config_path: &Path) -> Result<HostConfig> {
        let entry = self
            .hosts
            .get(host)
            .ok_or_else(|| BackupError::HostNotConfigured {
                host: host.to_string(),
                config: config_path.to_path_buf(),
            })?;

        let max_backups = entry.max_backups.unwrap_or(self.max_backups);
        let max_tail = entry.max_tail.unwrap_or(self.max_tail);
        let max_partials = entry.max_partials.unwrap_or(self.max_partials);

        if max_backups == 0 || max_tail == 0 || max_partials == 0 {
            return Err(BackupError::Config(format!(
                "Host '{}': max_backups, max_tail and max_partials must be at least 1",
                host
            )));
        }
        if max_tail.saturating_mul(max_tail) > max_backups {
            return Err(BackupError::TailTooLarge {
                host: host.to_string(),
                max_tail,
                max_backups,
            });
        }

        for dataset in &entry.data {
            validate_destination_name(host, &dataset.dst)?;
        }

        let logs = entry.logs.clone().unwrap_or_else(|| self.logs.clone());
        let target_dir = entry.target_dir.clone().unwrap_or_else(|| self.target_dir.clone());

        Ok(HostConfig {
            host: host.to_string(),
            uid: entry.uid.clone().unwrap_or_else(|| self.uid.clone()),
            target_dir: host_scoped(base_dir, &target_dir, host),
            log_dir: host_scoped(base_dir, &logs.dir, host),
            log_level: logs.level,
            data: entry.data.clone(),
            excludes: entry.excludes.clone().unwrap_or_else(|| self.excludes.clone()),
            rsync_opt_map: entry
                .rsync_opt_map
                .clone()
                .unwrap_or_else(|| self.rsync_opt_map.clone()),
            max_partials,
            retention: RetentionPolicy {
                max_backups,
                max_tail,
                mode: entry.retention.unwrap_or(self.retention),
            },
            transfer_program: entry
                .transfer_program
                .clone()
                .unwrap_or_else(|| self.transfer_program.clone()),
        })
    }
}

/// Locate the default configuration file next to the executable.
pub fn default_config_path(exe: &Path) -> Option<PathBuf> {
    let dir = exe.parent()?;
    ["yaml", "yml", "toml"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", DEFAULT_CONFIG_STEM, ext)))
        .find(|candidate| candidate.is_file())
}

/// Make `dir` absolute against `base_dir` and ensure it ends with `host`.
fn host_scoped(base_dir: &Path, dir: &Path, host: &str) -> PathBuf {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        base_dir.join(dir)
    };

    if absolute.file_name().map(|name| name == host).unwrap_or(false) {
        absolute
    } else {
        absolute.join(host)
    }
}

fn validate_destination_name(host: &str, dst: &str) -> Result<()> {
    let mut components = Path::new(dst).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_normal || dst.starts_with('.') {
        return Err(BackupError::Config(format!(
            "Host '{}': data-set destination '{}' must be a plain directory name",
            host, dst
        )));
    }
    Ok(())
}

/// Name of the effective user.
pub fn effective_user() -> Result<String> {
    let uid = nix::unistd::geteuid();
    let user = nix::unistd::User::from_uid(uid)
        .map_err(|e| BackupError::Config(format!("Cannot look up user {}: {}", uid, e)))?;
    Ok(user.map(|u| u.name).unwrap_or_else(|| uid.to_string()))
}

/// Fail unless running as `required`.
pub fn check_identity(required: &str) -> Result<()> {
    let actual = effective_user()?;
    if actual != required {
        return Err(BackupError::IdentityMismatch {
            required: required.to_string(),
            actual,
        });
    }
    Ok(())
}
