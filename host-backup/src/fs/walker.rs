//! Shallow directory listing for generation and log scans.
//!
//! Target roots and log directories are flat: only their immediate children
//! matter, and unreadable or unrelated entries are skipped rather than
//! aborting the scan.

use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Which kind of entries a listing keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// An immediate child of a scanned directory
#[derive(Debug, Clone)]
pub struct EntryInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// File name, lossily converted
    pub name: String,
}

impl EntryInfo {
    fn from_entry(entry: &DirEntry) -> Self {
        Self {
            path: entry.path().to_path_buf(),
            name: entry.file_name().to_string_lossy().to_string(),
        }
    }
}

fn matches_kind(entry: &DirEntry, kind: EntryKind) -> bool {
    // Follow symlinks so a linked generation or log still counts.
    let is_dir = match std::fs::metadata(entry.path()) {
        Ok(meta) => meta.is_dir(),
        Err(_) => return false,
    };
    match kind {
        EntryKind::Directory => is_dir,
        EntryKind::File => !is_dir,
    }
}

/// List the immediate children of `root` of the given kind, sorted by name.
///
/// A missing `root` yields an empty list.
pub fn list_children(root: &Path, kind: EntryKind) -> std::io::Result<Vec<EntryInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(e.into());
                }
                debug!("Skipping unreadable entry in {}: {}", root.display(), e);
                continue;
            }
        };

        if matches_kind(&entry, kind) {
            entries.push(EntryInfo::from_entry(&entry));
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_list_missing_root() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let entries = list_children(&temp_dir.path().join("absent"), EntryKind::Directory)?;
        assert!(entries.is_empty());
        Ok(())
    }

    #[test]
    fn test_list_directories_only() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("b"))?;
        fs::create_dir(temp_dir.path().join("a"))?;
        fs::create_dir_all(temp_dir.path().join("a/nested"))?;
        fs::write(temp_dir.path().join("file.txt"), b"content")?;

        let entries = list_children(temp_dir.path(), EntryKind::Directory)?;
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        Ok(())
    }

    #[test]
    fn test_list_files_only() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("dir"))?;
        fs::write(temp_dir.path().join("two.log"), b"2")?;
        fs::write(temp_dir.path().join("one.log"), b"1")?;

        let entries = list_children(temp_dir.path(), EntryKind::File)?;
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["one.log", "two.log"]);

        Ok(())
    }
}
