//! Generation catalog - the timestamped backup directories of one host.
//!
//! A host's target root holds one directory per generation, named by its
//! canonical timestamp. Anything else in the root is ignored.

pub mod marker;
pub mod timestamp;

use crate::fs::walker::{list_children, EntryKind};
use crate::utils::errors::{BackupError, Result};
use marker::{GenerationMarker, MarkerStatus};
use std::path::{Path, PathBuf};
use timestamp::Timestamp;
use tracing::warn;

/// Whether a generation can be trusted as a finished snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Marker says every data-set was transferred
    Complete,
    /// No marker; written before markers existed
    Unmarked,
    /// Marker says running or failed
    Incomplete,
    /// Marker cannot be read or parsed; left on disk untouched
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub timestamp: Timestamp,
    pub path: PathBuf,
    pub state: GenerationState,
}

impl Generation {
    /// Usable as a baseline and as a retention candidate.
    pub fn is_usable(&self) -> bool {
        matches!(self.state, GenerationState::Complete | GenerationState::Unmarked)
    }

    pub fn dataset_path(&self, dst: &str) -> PathBuf {
        self.path.join(dst)
    }

    pub fn has_dataset(&self, dst: &str) -> bool {
        self.dataset_path(dst).is_dir()
    }
}

fn read_state(dir: &Path) -> GenerationState {
    match GenerationMarker::read(dir) {
        Ok(None) => GenerationState::Unmarked,
        Ok(Some(marker)) if marker.status == MarkerStatus::Complete => GenerationState::Complete,
        Ok(Some(_)) => GenerationState::Incomplete,
        Err(e) => {
            warn!("Unreadable generation marker in {}: {}", dir.display(), e);
            GenerationState::Unknown
        }
    }
}

/// Scan `target_root` for generation directories, oldest first.
pub fn list_generations(target_root: &Path) -> Result<Vec<Generation>> {
    let mut generations: Vec<Generation> = list_children(target_root, EntryKind::Directory)?
        .into_iter()
        .filter_map(|entry| {
            let timestamp = Timestamp::parse(&entry.name)?;
            let state = read_state(&entry.path);
            Some(Generation {
                timestamp,
                path: entry.path,
                state,
            })
        })
        .collect();

    generations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(generations)
}

/// Ordered view of a host's generations.
#[derive(Debug, Clone)]
pub struct GenerationCatalog {
    root: PathBuf,
    generations: Vec<Generation>,
}

impl GenerationCatalog {
    pub fn scan(root: &Path) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            generations: list_generations(root)?,
        })
    }

    /// All generations, oldest first, whatever their state.
    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }

    pub fn usable(&self) -> impl DoubleEndedIterator<Item = &Generation> {
        self.generations.iter().filter(|g| g.is_usable())
    }

    /// Newest usable generation.
    pub fn newest(&self) -> Option<&Generation> {
        self.usable().last()
    }

    /// Newest usable generation that holds `dst`.
    pub fn baseline_for(&self, dst: &str) -> Option<&Generation> {
        self.usable().rev().find(|g| g.has_dataset(dst))
    }

    pub fn generation_path(&self, timestamp: &Timestamp) -> PathBuf {
        self.root.join(timestamp.as_str())
    }

    /// Catalog as it will look once the generation for `timestamp` is
    /// complete. Used by dry runs, where that directory is never written.
    pub fn with_pending(mut self, timestamp: &Timestamp) -> Self {
        let generation = Generation {
            timestamp: timestamp.clone(),
            path: self.generation_path(timestamp),
            state: GenerationState::Complete,
        };
        let at = self.generations.partition_point(|g| g.timestamp < generation.timestamp);
        if self.generations.get(at).map(|g| g.timestamp == generation.timestamp) != Some(true) {
            self.generations.insert(at, generation);
        }
        self
    }

    /// Accept `candidate` as the next generation name only if it sorts after
    /// every existing generation.
    pub fn check_next(&self, candidate: &Timestamp) -> Result<()> {
        match self.generations.last() {
            Some(newest) if newest.timestamp >= *candidate => Err(BackupError::TimestampNotIncreasing {
                timestamp: candidate.to_string(),
                newest: newest.timestamp.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
