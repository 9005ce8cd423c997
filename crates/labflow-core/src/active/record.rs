//! The per-action metadata record written when a container finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{OrchError, Result};
use crate::io::atomic_write;
use crate::model::{Action, ActionError, Sample, SequenceNumber};

pub const RECORD_VERSION: &str = "labflow/1";
pub const RECORD_FILE: &str = "action.yml";

/// One data-stream file produced by an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_name: String,
    pub sample_key: String,
    #[serde(default)]
    pub column_headings: Vec<String>,
    /// Unknown when the stream was cut off at the end of the grace period.
    #[serde(default)]
    pub rows: Option<u64>,
}

/// Fields are serialized in declaration order; readers rely on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub version: String,
    pub operation: String,
    pub server: String,
    pub orchestrator: Option<String>,
    pub machine: String,
    pub access: String,
    pub output_dir: PathBuf,
    pub process_group_id: Option<Uuid>,
    pub process_group_timestamp: Option<DateTime<Utc>>,
    pub process_group_label: Option<String>,
    pub action_id: Uuid,
    pub action_queue_time: Option<DateTime<Utc>>,
    pub action_sequence: SequenceNumber,
    pub action_params: Map<String, Value>,
    #[serde(default)]
    pub process_params: Map<String, Value>,
    #[serde(default)]
    pub error: Option<ActionError>,
    #[serde(default)]
    pub samples_in: Vec<Sample>,
    #[serde(default)]
    pub samples_out: Vec<Sample>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl ActionRecord {
    pub fn from_action(
        action: &Action,
        machine: &str,
        access: &str,
        files: Vec<FileEntry>,
    ) -> Result<Self> {
        let action_id = action
            .id
            .ok_or_else(|| OrchError::Validation("cannot record an action without an id".into()))?;
        let pg = action.process_group.as_ref();
        Ok(Self {
            version: RECORD_VERSION.to_string(),
            operation: action.operation.clone(),
            server: action.server.clone(),
            orchestrator: action.orchestrator.clone(),
            machine: machine.to_string(),
            access: access.to_string(),
            output_dir: action.output_dir.clone().unwrap_or_default(),
            process_group_id: pg.map(|p| p.id),
            process_group_timestamp: pg.map(|p| p.started_at),
            process_group_label: pg.map(|p| p.label.clone()),
            action_id,
            action_queue_time: action.queued_at,
            action_sequence: action.sequence,
            action_params: action.params.clone(),
            process_params: action.process_params.clone(),
            error: action.error.clone(),
            samples_in: action.samples_in.clone(),
            samples_out: action.samples_out.clone(),
            files,
        })
    }

    /// Write `action.yml` into `dir`. Returns the file path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(RECORD_FILE);
        let yaml = serde_yaml::to_string(self)?;
        atomic_write(&path, yaml.as_bytes())?;
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}
