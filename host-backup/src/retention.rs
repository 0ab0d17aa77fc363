//! Retention policies and generation thinning
//!
//! Thinning does not simply drop the oldest generation. Each pass walks the
//! catalog from the oldest end and evicts every `max_tail`-th generation, up
//! to `max_tail` of them, until at most `max_backups` remain. Recent history
//! stays dense while older history gets sparser.

use crate::catalog::{Generation, GenerationCatalog, GenerationState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    /// Periodic-stride thinning
    #[default]
    Thin,
    /// Legacy policy: drop the oldest until under capacity
    Fifo,
}

/// Retention policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Generations kept after retention
    pub max_backups: usize,
    /// Stride and per-pass eviction limit
    pub max_tail: usize,
    pub mode: RetentionMode,
}

/// Indices evicted by one thinning pass over `len` generations:
/// `0, max_tail, 2*max_tail, ...`, at most `max_tail` of them.
pub fn thinning_pass(len: usize, max_tail: usize) -> Vec<usize> {
    let stride = max_tail.max(1);
    (0..len).step_by(stride).take(stride).collect()
}

/// Split `items` (oldest first) into survivors and evictions under `policy`.
///
/// Evictions are returned in the order their passes chose them.
pub fn select_evictions<T>(items: Vec<T>, policy: &RetentionPolicy) -> (Vec<T>, Vec<T>) {
    let mut survivors = items;
    let mut evicted = Vec::new();

    while survivors.len() > policy.max_backups {
        let picks = match policy.mode {
            RetentionMode::Thin => thinning_pass(survivors.len(), policy.max_tail),
            RetentionMode::Fifo => vec![0],
        };

        // Remove from the back so earlier indices stay valid.
        let mut batch: Vec<T> = picks.into_iter().rev().map(|idx| survivors.remove(idx)).collect();
        batch.reverse();
        evicted.extend(batch);
    }

    (survivors, evicted)
}

#[derive(Debug, Default)]
pub struct ThinningOutcome {
    /// Generations left for bookkeeping, oldest first
    pub survivors: Vec<Generation>,
    /// Evicted by the policy
    pub evicted: Vec<Generation>,
    /// Incomplete generations from earlier failed or killed runs
    pub abandoned: Vec<Generation>,
    /// Directories whose removal failed
    pub failed: Vec<PathBuf>,
}

/// Apply `policy` to a scanned catalog, deleting what it evicts.
///
/// Deletion failures are logged and skipped; the generation still counts
/// as gone. Generations with an unreadable marker are neither counted nor
/// deleted.
pub fn thin(catalog: &GenerationCatalog, policy: &RetentionPolicy, dry_run: bool) -> ThinningOutcome {
    let mut usable = Vec::new();
    let mut abandoned = Vec::new();
    for generation in catalog.generations() {
        match generation.state {
            GenerationState::Complete | GenerationState::Unmarked => usable.push(generation.clone()),
            GenerationState::Incomplete => abandoned.push(generation.clone()),
            GenerationState::Unknown => warn!(
                "Leaving {} in place: its marker cannot be read",
                generation.path.display()
            ),
        }
    }

    let (survivors, evicted) = select_evictions(usable, policy);

    let mut outcome = ThinningOutcome {
        survivors,
        evicted,
        abandoned,
        failed: Vec::new(),
    };

    for generation in &outcome.abandoned {
        info!("Removing incomplete backup directory: {}", generation.path.display());
        remove_generation(generation, dry_run, &mut outcome.failed);
    }

    for generation in &outcome.evicted {
        info!("Removing backup directory: {}", generation.path.display());
        remove_generation(generation, dry_run, &mut outcome.failed);
    }

    outcome
}

fn remove_generation(generation: &Generation, dry_run: bool, failed: &mut Vec<PathBuf>) {
    if dry_run {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(&generation.path) {
        error!("Failed to remove {}: {}", generation.path.display(), e);
        failed.push(generation.path.clone());
    }
}
