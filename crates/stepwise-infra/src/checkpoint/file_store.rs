//! File-backed [`CheckpointStore`].
//!
//! The record is written as pretty JSON to a temporary sibling file, synced,
//! renamed over the target and the parent directory is synced. Readers never
//! observe a partially written checkpoint.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use stepwise_core::workflow::checkpoint::{CheckpointError, CheckpointStore};
use stepwise_types::checkpoint::{CHECKPOINT_FORMAT_VERSION, CheckpointRecord};

/// Default checkpoint location for a workflow:
/// `<dir>/<workflow>.checkpoint.json`.
pub fn checkpoint_path_for(dir: &Path, workflow: &str) -> PathBuf {
    dir.join(format!("{workflow}.checkpoint.json"))
}

/// Checkpoint record stored in a single JSON file.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location for `workflow` under `dir`.
    pub fn for_workflow(dir: &Path, workflow: &str) -> Self {
        Self::new(checkpoint_path_for(dir, workflow))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Delete the checkpoint file. Missing files are not an error.
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn corrupted(&self, reason: impl ToString) -> CheckpointError {
        CheckpointError::Corrupted {
            location: self.location(),
            reason: reason.to_string(),
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no checkpoint file");
                return Ok(None);
            }
            Err(e) => {
                return Err(CheckpointError::Unreadable {
                    location: self.location(),
                    reason: e.to_string(),
                });
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(self.corrupted("file is empty"));
        }

        let record: CheckpointRecord =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupted(e))?;

        if record.format_version > CHECKPOINT_FORMAT_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                found = record.format_version,
                supported = CHECKPOINT_FORMAT_VERSION,
                "checkpoint written by a newer engine, unknown fields are ignored"
            );
        }

        tracing::debug!(
            path = %self.path.display(),
            entries = record.entries.len(),
            "loaded checkpoint"
        );
        Ok(Some(record))
    }

    async fn persist(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let persist_err = |reason: String| CheckpointError::Persist {
            location: self.location(),
            reason,
        };

        let bytes = serde_json::to_vec_pretty(record).map_err(|e| persist_err(e.to_string()))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write_file(&path, &bytes))
            .await
            .map_err(|e| persist_err(format!("write task failed: {e}")))?
            .map_err(|e| persist_err(e.to_string()))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

// ---------------------------------------------------------------------------
// Atomic write
// ---------------------------------------------------------------------------

fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let tmp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("checkpoint"),
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    let tmp_path = parent.join(tmp_name);

    let written = (|| {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    written?;

    sync_parent_dir(parent)
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use stepwise_types::checkpoint::CheckpointEntry;
    use stepwise_types::error::ErrorKind;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn record_with_entry() -> CheckpointRecord {
        let mut record = CheckpointRecord::new("release", Uuid::now_v7());
        record.entries.insert(
            "build".to_string(),
            CheckpointEntry {
                output: json!({ "tag": "v1" }),
                completed_at: Utc::now(),
                sequence: 0,
                fallback: false,
            },
        );
        record
    }

    #[test]
    fn checkpoint_path_uses_workflow_name() {
        let path = checkpoint_path_for(Path::new("/tmp/cp"), "release");
        assert_eq!(path, PathBuf::from("/tmp/cp/release.checkpoint.json"));
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::for_workflow(tmp.path(), "release");
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn persist_then_load_returns_same_record() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::for_workflow(&tmp.path().join("nested/dir"), "release");
        let record = record_with_entry();

        store.persist(&record).await.unwrap();
        assert!(store.exists().await);
        assert_eq!(store.load().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn persist_leaves_no_temporary_files() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::for_workflow(tmp.path(), "release");
        store.persist(&record_with_entry()).await.unwrap();
        store.persist(&record_with_entry()).await.unwrap();

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["release.checkpoint.json"]);
    }

    #[tokio::test]
    async fn invalid_json_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::for_workflow(tmp.path(), "release");
        tokio::fs::write(store.path(), "{ not json").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CheckpointCorruptionError);
        assert!(err.to_string().contains("release.checkpoint.json"));
    }

    #[tokio::test]
    async fn empty_file_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::for_workflow(tmp.path(), "release");
        tokio::fs::write(store.path(), "\n").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted { .. }));
    }

    #[tokio::test]
    async fn directory_in_place_of_file_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::for_workflow(tmp.path(), "release");
        tokio::fs::create_dir(store.path()).await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Unreadable { .. }));
    }

    #[tokio::test]
    async fn records_from_newer_engines_still_load() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::for_workflow(tmp.path(), "release");
        let body = json!({
            "format_version": CHECKPOINT_FORMAT_VERSION + 1,
            "workflow": "release",
            "entries": {
                "build": {
                    "output": "ok",
                    "completed_at": "2026-01-01T00:00:00Z",
                    "attempts": 3
                }
            },
            "labels": ["future"]
        });
        tokio::fs::write(store.path(), body.to_string()).await.unwrap();

        let record = store.load().await.unwrap().unwrap();
        assert_eq!(record.entries["build"].output, json!("ok"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::for_workflow(tmp.path(), "release");
        store.persist(&record_with_entry()).await.unwrap();

        store.remove().await.unwrap();
        store.remove().await.unwrap();
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn dispatcher_resumes_from_file_checkpoint() {
        use std::collections::BTreeMap;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use stepwise_core::workflow::definition::parse_workflow_yaml;
        use stepwise_core::workflow::handler::{
            FnHandler, HandlerError, HandlerInput, HandlerRegistry,
        };
        use stepwise_core::workflow::{Dispatcher, RunOptions};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = HandlerRegistry::new();
        registry.register(
            "count",
            FnHandler::new(move |input: HandlerInput| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(json!({ "step": input.step }))
                }
            }),
        );
        let dispatcher = Dispatcher::builder(registry).build();
        let def = parse_workflow_yaml(
            "name: tally\nversion: \"0.1.0\"\nsteps:\n  - name: one\n    type: python\n    action: count\n  - name: two\n    type: python\n    action: count\n",
        )
        .unwrap();

        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::for_workflow(tmp.path(), &def.name);
        dispatcher
            .run(&def, BTreeMap::new(), RunOptions::with_checkpoint(store.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let resumed = dispatcher
            .run(&def, BTreeMap::new(), RunOptions::with_checkpoint(store))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(resumed.restored_steps, vec!["one", "two"]);
        assert_eq!(resumed.step_outputs["two"], json!({ "step": "two" }));
    }
}
