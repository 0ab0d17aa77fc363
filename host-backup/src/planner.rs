//! Transfer planning: backup type, per data-set baselines and flags.
//!
//! Every data-set is planned before anything is written, so configuration
//! problems and missing baselines stop the run while the target is untouched.

use crate::catalog::GenerationCatalog;
use crate::config::{DataSet, HostConfig, TransferOptionRule};
use crate::fs::probe::FsProbe;
use crate::utils::errors::{BackupError, Result};
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    /// Full when `count` is 0 or a multiple of `max_partials`.
    pub fn for_partial_count(count: u64, max_partials: u64) -> Self {
        if count == 0 || count % max_partials.max(1) == 0 {
            BackupType::Full
        } else {
            BackupType::Incremental
        }
    }

    /// Count to persist after a successful run of this type.
    pub fn next_partial_count(self, previous: u64) -> u64 {
        match self {
            BackupType::Full => 0,
            BackupType::Incremental => previous.saturating_add(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "Full",
            BackupType::Incremental => "Incremental",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First rule listing both kinds, if it carries any options.
pub fn select_options<'a>(
    table: &'a [TransferOptionRule],
    src_kind: &str,
    dst_kind: &str,
) -> Option<&'a [String]> {
    table
        .iter()
        .find(|rule| {
            rule.src_fs_type.iter().any(|k| k == src_kind)
                && rule.dst_fs_type.iter().any(|k| k == dst_kind)
        })
        .map(|rule| rule.options.as_slice())
        .filter(|options| !options.is_empty())
}

/// Source argument with a trailing separator, so the tool copies the
/// directory's contents rather than the directory itself.
pub fn source_arg(src: &Path) -> OsString {
    let mut arg = src.as_os_str().to_os_string();
    if !src.to_string_lossy().ends_with('/') {
        arg.push("/");
    }
    arg
}

/// Everything needed to transfer one data-set.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub dataset: DataSet,
    pub destination: PathBuf,
    pub baseline: Option<PathBuf>,
    pub options: Vec<String>,
    pub src_kind: String,
    pub dst_kind: String,
}

impl TransferPlan {
    /// `[flags...] [--exclude pattern]* [--link-dest baseline]? source/ destination`
    pub fn args(&self, excludes: &[String]) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.options.iter().map(OsString::from).collect();

        for pattern in excludes {
            args.push("--exclude".into());
            args.push(pattern.into());
        }

        if let Some(baseline) = &self.baseline {
            args.push("--link-dest".into());
            args.push(baseline.as_os_str().to_os_string());
        }

        args.push(source_arg(&self.dataset.src));
        args.push(self.destination.as_os_str().to_os_string());
        args
    }
}

pub struct TransferPlanner<'a, P: FsProbe> {
    config: &'a HostConfig,
    probe: &'a P,
}

impl<'a, P: FsProbe> TransferPlanner<'a, P> {
    pub fn new(config: &'a HostConfig, probe: &'a P) -> Self {
        Self { config, probe }
    }

    /// Plan every configured data-set for a run writing into `generation`.
    pub fn plan(
        &self,
        catalog: &GenerationCatalog,
        backup_type: BackupType,
        generation: &Path,
    ) -> Result<Vec<TransferPlan>> {
        let dst_kind = self.probe.fs_kind(&existing_ancestor(&self.config.target_dir));

        self.config
            .data
            .iter()
            .map(|dataset| self.plan_dataset(catalog, backup_type, generation, dataset, &dst_kind))
            .collect()
    }

    fn plan_dataset(
        &self,
        catalog: &GenerationCatalog,
        backup_type: BackupType,
        generation: &Path,
        dataset: &DataSet,
        dst_kind: &str,
    ) -> Result<TransferPlan> {
        let src_kind = self.probe.fs_kind(&dataset.src);
        debug!("src fs type: {}, dst fs type: {}", src_kind, dst_kind);

        let options = select_options(&self.config.rsync_opt_map, &src_kind, dst_kind)
            .ok_or_else(|| BackupError::NoTransferOptions {
                src_kind: src_kind.clone(),
                dst_kind: dst_kind.to_string(),
                source_path: dataset.src.clone(),
            })?
            .to_vec();

        let baseline = match backup_type {
            BackupType::Full => None,
            BackupType::Incremental => {
                let baseline = catalog.baseline_for(&dataset.dst).ok_or_else(|| {
                    BackupError::MissingBaseline {
                        dataset: dataset.dst.clone(),
                    }
                })?;
                Some(baseline.dataset_path(&dataset.dst))
            }
        };

        Ok(TransferPlan {
            dataset: dataset.clone(),
            destination: generation.join(&dataset.dst),
            baseline,
            options,
            src_kind,
            dst_kind: dst_kind.to_string(),
        })
    }
}

/// Closest ancestor of `path` that exists (the path itself if it does).
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .unwrap_or(path)
        .to_path_buf()
}
