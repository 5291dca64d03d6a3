//! Run metadata sidecar (`metadata.json`).
//!
//! Written next to the data file at the end of every run, whatever its outcome, so a directory
//! of results can be indexed without parsing data file headers.

use crate::config::{MeasurementKind, Settings};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every point was measured
    Completed,
    /// Stopped by the operator
    Cancelled,
    /// Stopped by an instrument or storage error
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Captures what a run was and how it went.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    /// Unique id of the run
    pub run_id: Uuid,
    /// Run directory name
    pub run_name: String,
    /// Measurement kind
    pub kind: MeasurementKind,
    /// Device under test
    pub sample_id: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome
    pub status: RunStatus,
    /// Number of data rows saved
    pub rows: usize,
    /// Data file name, relative to the run directory
    pub data_file: Option<String>,
    /// Plot file names, relative to the run directory
    pub plots: Vec<String>,
    /// Error that ended the run
    pub error: Option<String>,
    /// Readings taken once per run (temperatures, humidity)
    pub environment: HashMap<String, f64>,
    /// Settings the run used
    pub settings: serde_json::Value,
    /// Version of the acquisition software
    pub software_version: String,
}

impl RunMetadata {
    /// Metadata for a run that is just starting.
    pub fn start(
        run_id: Uuid,
        run_name: &str,
        started_at: DateTime<Utc>,
        settings: &Settings,
    ) -> Self {
        Self {
            run_id,
            run_name: run_name.to_string(),
            kind: settings.measurement.kind,
            sample_id: settings.measurement.sample_id.clone(),
            started_at,
            finished_at: None,
            status: RunStatus::Failed,
            rows: 0,
            data_file: None,
            plots: Vec::new(),
            error: None,
            environment: HashMap::new(),
            settings: serde_json::to_value(settings).unwrap_or(serde_json::Value::Null),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Record the outcome.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// Write as pretty JSON.
    pub fn write(&self, path: &Path) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DaqError::Storage(format!("Failed to serialize metadata: {}", e)))?;
        std::fs::write(path, json).map_err(|e| {
            DaqError::Storage(format!("Failed to write '{}': {}", path.display(), e))
        })
    }

    /// Read a previously written sidecar.
    pub fn read(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| DaqError::Storage(format!("Invalid metadata '{}': {}", path.display(), e)))
    }
}
