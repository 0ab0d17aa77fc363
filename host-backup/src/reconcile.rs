//! Run log naming and reconciliation against surviving generations.

use crate::catalog::timestamp::Timestamp;
use crate::fs::walker::{list_children, EntryKind};
use crate::utils::errors::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{error, info};

const LOG_SUFFIX: &str = ".log";

/// `<host>-<timestamp>.log`
pub fn log_file_name(host: &str, timestamp: &Timestamp) -> String {
    format!("{}-{}{}", host, timestamp, LOG_SUFFIX)
}

pub fn run_log_path(log_dir: &Path, host: &str, timestamp: &Timestamp) -> PathBuf {
    log_dir.join(log_file_name(host, timestamp))
}

/// Timestamp embedded in a run log name for `host`, if the name follows
/// the convention.
pub fn parse_log_name(host: &str, name: &str) -> Option<Timestamp> {
    let rest = name.strip_prefix(host)?.strip_prefix('-')?;
    Timestamp::parse(rest.strip_suffix(LOG_SUFFIX)?)
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Delete every run log of `host` whose generation is not in `survivors`.
/// Files not following the naming convention are left alone.
pub fn reconcile_logs<'a, I>(log_dir: &Path, host: &str, survivors: I, dry_run: bool) -> Result<ReconcileOutcome>
where
    I: IntoIterator<Item = &'a Timestamp>,
{
    let surviving: HashSet<&Timestamp> = survivors.into_iter().collect();
    let mut outcome = ReconcileOutcome::default();

    for entry in list_children(log_dir, EntryKind::File)? {
        let Some(timestamp) = parse_log_name(host, &entry.name) else {
            continue;
        };

        if surviving.contains(&timestamp) {
            continue;
        }

        info!("Removing log file {}", entry.path.display());
        if dry_run {
            outcome.removed.push(entry.path);
            continue;
        }
        match std::fs::remove_file(&entry.path) {
            Ok(()) => outcome.removed.push(entry.path),
            Err(e) => {
                error!("Failed to remove log file {}: {}", entry.path.display(), e);
                outcome.failed.push(entry.path);
            }
        }
    }

    Ok(outcome)
}
