//! Generation completion marker.
//!
//! Serialized as `.generation.json` in each generation directory. A
//! generation only counts as finished once its marker says `complete`.

use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MARKER_FILE: &str = ".generation.json";
const MARKER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMarker {
    pub version: u32,
    pub host: String,
    pub run_id: String,
    pub backup_type: String,
    pub status: MarkerStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub datasets: Vec<String>,
}

impl GenerationMarker {
    pub fn running(host: &str, run_id: &str, backup_type: &str, datasets: Vec<String>) -> Self {
        Self {
            version: MARKER_VERSION,
            host: host.to_string(),
            run_id: run_id.to_string(),
            backup_type: backup_type.to_string(),
            status: MarkerStatus::Running,
            started_at: chrono::Local::now().to_rfc3339(),
            finished_at: None,
            datasets,
        }
    }

    /// Close the marker with a final status.
    pub fn finish(&mut self, status: MarkerStatus) {
        self.status = status;
        self.finished_at = Some(chrono::Local::now().to_rfc3339());
    }

    /// Read the marker in `dir`; `Ok(None)` when there is none.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MARKER_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write the marker into `dir`, replacing any previous one in a single rename.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = dir.join(format!("{}.tmp", MARKER_FILE));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, dir.join(MARKER_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_marker() -> Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(GenerationMarker::read(temp_dir.path())?.is_none());
        Ok(())
    }

    #[test]
    fn test_running_then_complete() -> Result<()> {
        let temp_dir = TempDir::new()?;

        let mut marker = GenerationMarker::running("lappy", "run-1", "Full", vec!["home".to_string()]);
        marker.write(temp_dir.path())?;

        let read = GenerationMarker::read(temp_dir.path())?.unwrap();
        assert_eq!(read.status, MarkerStatus::Running);
        assert!(read.finished_at.is_none());

        marker.finish(MarkerStatus::Complete);
        marker.write(temp_dir.path())?;

        let read = GenerationMarker::read(temp_dir.path())?.unwrap();
        assert_eq!(read.status, MarkerStatus::Complete);
        assert!(read.finished_at.is_some());
        assert_eq!(read.datasets, vec!["home".to_string()]);
        assert!(!temp_dir.path().join(".generation.json.tmp").exists());

        Ok(())
    }

    #[test]
    fn test_corrupt_marker_is_an_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::write(temp_dir.path().join(MARKER_FILE), b"{ not json")?;
        assert!(GenerationMarker::read(temp_dir.path()).is_err());
        Ok(())
    }
}
