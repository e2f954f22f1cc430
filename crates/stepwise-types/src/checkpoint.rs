//! Persisted checkpoint record.
//!
//! One record per workflow run, keyed by step name. The JSON shape only ever
//! grows: every field added after the first format version is optional on
//! read and unknown fields are ignored, so older and newer engines can read
//! each other's files.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current on-disk format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Durable record of the steps a run has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    /// Name of the workflow this record belongs to.
    pub workflow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Resolved run inputs at the time the record was created.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    /// Completed steps keyed by step name.
    #[serde(default)]
    pub entries: BTreeMap<String, CheckpointEntry>,
}

fn default_format_version() -> u32 {
    CHECKPOINT_FORMAT_VERSION
}

/// Output of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub output: Value,
    pub completed_at: DateTime<Utc>,
    /// Append order within the run (0-based).
    #[serde(default)]
    pub sequence: u64,
    /// Whether the output came from a fallback handler.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl CheckpointRecord {
    /// Create an empty record for a new run.
    pub fn new(workflow: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            workflow: workflow.into(),
            run_id: Some(run_id),
            created_at: Some(Utc::now()),
            inputs: BTreeMap::new(),
            entries: BTreeMap::new(),
        }
    }

    pub fn contains(&self, step: &str) -> bool {
        self.entries.contains_key(step)
    }

    /// Entries ordered by append sequence.
    pub fn in_completion_order(&self) -> Vec<(&str, &CheckpointEntry)> {
        let mut entries: Vec<(&str, &CheckpointEntry)> = self
            .entries
            .iter()
            .map(|(name, entry)| (name.as_str(), entry))
            .collect();
        entries.sort_by_key(|(name, entry)| (entry.sequence, *name));
        entries
    }

    pub fn next_sequence(&self) -> u64 {
        self.entries
            .values()
            .map(|e| e.sequence + 1)
            .max()
            .unwrap_or(0)
    }
}
