//! Run output: data files, plots and the directory they land in.
pub mod plot;
pub mod storage;

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::info;

/// Directory holding everything one run produces.
///
/// Named `<YYYYmmdd_HHMMSS>_<sample id>` under the configured output directory, so runs sort by
/// start time and never overwrite each other.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    name: String,
    path: PathBuf,
    started_at: DateTime<Local>,
}

impl RunDirectory {
    /// Create the directory for a run of `sample_id` starting now.
    pub fn create(output_dir: &Path, sample_id: &str) -> AppResult<Self> {
        let started_at = Local::now();
        let name = format!(
            "{}_{}",
            started_at.format("%Y%m%d_%H%M%S"),
            sanitize(sample_id)
        );
        let path = output_dir.join(&name);
        if path.exists() {
            return Err(DaqError::Storage(format!(
                "Run directory '{}' already exists",
                path.display()
            )));
        }
        std::fs::create_dir_all(&path).map_err(|e| {
            DaqError::Storage(format!("Failed to create '{}': {}", path.display(), e))
        })?;
        info!("Run directory: {}", path.display());

        Ok(Self {
            name,
            path,
            started_at,
        })
    }

    /// Directory name, also used as the run name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Local time the run started
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Path of `file_name` inside the run directory
    pub fn file(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }
}

/// Keep sample ids usable as file name parts.
pub fn sanitize(sample_id: &str) -> String {
    let cleaned: String = sample_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "sample".to_string()
    } else {
        cleaned
    }
}
