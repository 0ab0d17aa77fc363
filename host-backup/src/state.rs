//! Per-host partial count persistence.
//!
//! The count lives in a one-line file in the host's log directory. Missing
//! or garbled content reads as "no state", which steers the next run
//! towards a Full backup.

use crate::utils::errors::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PARTIALS_FILE: &str = ".partials";

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store kept in a host's own log directory.
    pub fn in_dir(host_dir: &Path) -> Self {
        Self {
            path: host_dir.join(PARTIALS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted count, or `None` when absent or unparsable.
    pub fn load(&self) -> Option<u64> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot read {}: {}", self.path.display(), e);
                }
                return None;
            }
        };

        let parsed = content.lines().next().and_then(|line| line.trim().parse().ok());
        if parsed.is_none() {
            warn!(
                "Ignoring malformed partial count in {}",
                self.path.display()
            );
        }
        parsed
    }

    pub fn get_partial_count(&self) -> u64 {
        self.load().unwrap_or(0)
    }

    /// Position of the upcoming run in the Full/Incremental cycle: 0 without
    /// usable state, otherwise one past the persisted count.
    pub fn run_ordinal(&self) -> u64 {
        self.load().map(|n| n.saturating_add(1)).unwrap_or(0)
    }

    /// Overwrite the count. The new value lands in a single rename.
    pub fn set_partial_count(&self, value: u64) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n", value))?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Partial count set to {} in {}", value, self.path.display());
        Ok(())
    }
}
