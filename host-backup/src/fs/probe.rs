//! Filesystem-kind probing.
//!
//! Resolves a path to the coarse filesystem type label of its mount
//! (`ext4`, `xfs`, `nfs4`, ...). Transfer options are keyed on these labels.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Label used when the probe cannot tell.
pub const UNKNOWN_FS: &str = "unknown";

/// Maps a path to a filesystem-kind label.
pub trait FsProbe {
    fn fs_kind(&self, path: &Path) -> String;
}

/// Probe backed by `findmnt -n -o FSTYPE -T <path>`.
#[derive(Debug, Clone, Default)]
pub struct FindmntProbe;

impl FsProbe for FindmntProbe {
    fn fs_kind(&self, path: &Path) -> String {
        let output = Command::new("findmnt")
            .args(["-n", "-o", "FSTYPE", "-T"])
            .arg(path)
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                first_line(&stdout).unwrap_or_else(|| UNKNOWN_FS.to_string())
            }
            Ok(output) => {
                debug!("findmnt exited with {} for {}", output.status, path.display());
                UNKNOWN_FS.to_string()
            }
            Err(e) => {
                debug!("findmnt failed for {}: {}", path.display(), e);
                UNKNOWN_FS.to_string()
            }
        }
    }
}

fn first_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
}

/// Fixed path-prefix probe; the longest matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    kinds: HashMap<PathBuf, String>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, prefix: impl Into<PathBuf>, kind: &str) -> Self {
        self.kinds.insert(prefix.into(), kind.to_string());
        self
    }
}

impl FsProbe for StaticProbe {
    fn fs_kind(&self, path: &Path) -> String {
        self.kinds
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.components().count())
            .map(|(_, kind)| kind.clone())
            .unwrap_or_else(|| UNKNOWN_FS.to_string())
    }
}
