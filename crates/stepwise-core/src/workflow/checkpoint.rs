//! Durable checkpoint manager for workflow runs.
//!
//! Wraps a `CheckpointStore` to record one entry per completed step so an
//! interrupted run can resume by skipping everything already done. Every
//! append is persisted before the dispatcher moves to the next step.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use stepwise_types::checkpoint::{CheckpointEntry, CheckpointRecord};
use stepwise_types::error::ErrorKind;
use uuid::Uuid;

use super::context::SlotLayout;

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Persistence backend for a single run's checkpoint record.
///
/// Implementations live in the infrastructure layer (file store) or in this
/// crate for tests (`MemoryCheckpointStore`).
pub trait CheckpointStore: Send + Sync {
    /// Load the persisted record, or `None` if nothing has been written.
    fn load(
        &self,
    ) -> impl Future<Output = Result<Option<CheckpointRecord>, CheckpointError>> + Send;

    /// Replace the persisted record.
    fn persist(
        &self,
        record: &CheckpointRecord,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Human-readable location used in errors and logs.
    fn location(&self) -> String;
}

/// In-memory store. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    record: Arc<Mutex<Option<CheckpointRecord>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing record, as if it had been persisted earlier.
    pub fn with_record(record: CheckpointRecord) -> Self {
        let store = Self::default();
        *store.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(record);
        store
    }

    /// Current persisted record.
    pub fn record(&self) -> Option<CheckpointRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of successful `persist` calls.
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.record())
    }

    async fn persist(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Owns the run's checkpoint record behind an async mutex.
///
/// Generic over `S: CheckpointStore` so it works with any backend. Append is
/// the only operation that takes the lock for a write; it persists before
/// releasing it, so a write for step N completes before step N+1 starts.
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
    record: tokio::sync::Mutex<CheckpointRecord>,
    restored: Vec<(String, CheckpointEntry)>,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    /// Start a fresh record, ignoring anything already persisted.
    pub fn start(
        store: S,
        workflow: &str,
        run_id: Uuid,
        inputs: &BTreeMap<String, Value>,
    ) -> Self {
        let mut record = CheckpointRecord::new(workflow, run_id);
        record.inputs = inputs.clone();
        Self {
            store,
            record: tokio::sync::Mutex::new(record),
            restored: Vec::new(),
        }
    }

    /// Load the persisted record, if any, and validate it for this workflow.
    ///
    /// A record for another workflow, or one naming a step the workflow does
    /// not declare, is treated as corruption. Falls back to a fresh record
    /// when nothing has been persisted.
    pub async fn resume(
        store: S,
        workflow: &str,
        run_id: Uuid,
        layout: &SlotLayout,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<Self, CheckpointError> {
        let Some(record) = store.load().await? else {
            tracing::debug!(location = %store.location(), "no checkpoint found, starting fresh");
            return Ok(Self::start(store, workflow, run_id, inputs));
        };

        if record.workflow != workflow {
            return Err(CheckpointError::Corrupted {
                location: store.location(),
                reason: format!(
                    "checkpoint belongs to workflow '{}', not '{workflow}'",
                    record.workflow
                ),
            });
        }
        if let Some(unknown) = record.entries.keys().find(|name| !layout.contains(name)) {
            return Err(CheckpointError::Corrupted {
                location: store.location(),
                reason: format!("entry for undeclared step '{unknown}'"),
            });
        }
        if !record.inputs.is_empty() && &record.inputs != inputs {
            tracing::warn!(
                location = %store.location(),
                "resuming with inputs that differ from the checkpointed run"
            );
        }

        let restored = record
            .in_completion_order()
            .into_iter()
            .map(|(name, entry)| (name.to_string(), entry.clone()))
            .collect::<Vec<_>>();

        tracing::info!(
            location = %store.location(),
            workflow,
            restored = restored.len(),
            "loaded checkpoint"
        );

        Ok(Self {
            store,
            record: tokio::sync::Mutex::new(record),
            restored,
        })
    }

    /// Entries loaded at resume, in completion order.
    pub fn restored(&self) -> &[(String, CheckpointEntry)] {
        &self.restored
    }

    /// Append a completed step and persist. Returns the entry's sequence.
    ///
    /// Appending a step that already has an entry is a no-op that returns
    /// the existing sequence.
    pub async fn append(
        &self,
        step: &str,
        output: &Value,
        fallback: bool,
    ) -> Result<u64, CheckpointError> {
        let mut record = self.record.lock().await;
        if let Some(existing) = record.entries.get(step) {
            return Ok(existing.sequence);
        }

        let sequence = record.next_sequence();
        record.entries.insert(
            step.to_string(),
            CheckpointEntry {
                output: output.clone(),
                completed_at: Utc::now(),
                sequence,
                fallback,
            },
        );

        if let Err(e) = self.store.persist(&record).await {
            record.entries.remove(step);
            return Err(e);
        }

        tracing::debug!(step, sequence, "checkpointed step");
        Ok(sequence)
    }

    /// Persist the current record as-is.
    pub async fn flush(&self) -> Result<(), CheckpointError> {
        let record = self.record.lock().await;
        self.store.persist(&record).await
    }

    /// Copy of the current record.
    pub async fn snapshot(&self) -> CheckpointRecord {
        self.record.lock().await.clone()
    }

    pub fn location(&self) -> String {
        self.store.location()
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The record exists but is not a valid checkpoint for this run.
    #[error("checkpoint at {location} is corrupted: {reason}")]
    Corrupted { location: String, reason: String },

    /// The record exists but could not be read.
    #[error("checkpoint at {location} could not be read: {reason}")]
    Unreadable { location: String, reason: String },

    #[error("failed to persist checkpoint at {location}: {reason}")]
    Persist { location: String, reason: String },
}

impl CheckpointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckpointError::Corrupted { .. } | CheckpointError::Unreadable { .. } => {
                ErrorKind::CheckpointCorruptionError
            }
            CheckpointError::Persist { .. } => ErrorKind::CheckpointWriteError,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
