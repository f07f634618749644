//! Durable task state backed by a single JSON document
//!
//! The whole document is rewritten on every task transition through
//! [`write_atomic`], and rotated aside when it grows past the configured
//! size or task count.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::files::{file_len, rotate_file, safe_file_stem, write_atomic};
use super::types::{Task, TaskId, WorkerResult};
use crate::error::{PersistError, PersistResult};

/// File name of the state document inside the coordination directory
pub const STATE_FILE_NAME: &str = "orchestrator_state.json";

/// Version stamped into every state document
pub const SCHEMA_VERSION: &str = "1.1.0";

/// When to rotate a file and how many rotations to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    /// Entry limit: tasks for the state file, lines for the audit log
    pub max_entries: usize,
    pub keep: usize,
}

impl RotationPolicy {
    pub const STATE: RotationPolicy = RotationPolicy {
        max_bytes: 5 * 1024 * 1024,
        max_entries: 2000,
        keep: 3,
    };

    pub const LOG: RotationPolicy = RotationPolicy {
        max_bytes: 10 * 1024 * 1024,
        max_entries: 10_000,
        keep: 5,
    };
}

/// Index entry for one persisted worker session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(rename = "model")]
    pub worker: String,
    pub task_id: TaskId,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

impl SessionRecord {
    /// Key under which the record is indexed: `<safe-worker>_<task_id>`.
    pub fn key(&self) -> String {
        format!("{}_{}", safe_file_stem(&self.worker), self.task_id)
    }
}

/// On-disk state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    #[serde(default)]
    pub sessions: Vec<(String, SessionRecord)>,
    /// `[id, task]` pairs in creation order
    #[serde(default)]
    pub tasks: Vec<(TaskId, Task)>,
    pub last_updated: DateTime<Utc>,
    pub schema_version: String,
}

impl StateDocument {
    pub fn new(sessions: Vec<(String, SessionRecord)>, tasks: Vec<(TaskId, Task)>) -> Self {
        Self {
            sessions,
            tasks,
            last_updated: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|(task_id, _)| task_id == id)
            .map(|(_, task)| task)
    }
}

/// Shared reference to a TaskStateStore
pub type SharedStateStore = Arc<TaskStateStore>;

/// JSON-file task state store
pub struct TaskStateStore {
    path: PathBuf,
    sessions_dir: PathBuf,
    rotation: RotationPolicy,
    /// Serializes rotate + rewrite sequences
    write_lock: Mutex<()>,
}

impl TaskStateStore {
    /// Store rooted at `coordination_dir`. No IO happens until the first write.
    pub fn new(coordination_dir: impl AsRef<Path>, rotation: RotationPolicy) -> Self {
        let dir = coordination_dir.as_ref();
        Self {
            path: dir.join(STATE_FILE_NAME),
            sessions_dir: dir.join("sessions"),
            rotation,
            write_lock: Mutex::new(()),
        }
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Write an empty document if none exists yet.
    pub fn ensure_baseline(&self) -> PersistResult<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.save(&StateDocument::empty())
    }

    /// Rewrite the state document, rotating the previous one first when it
    /// is over the size limit or `doc` carries too many tasks. A failed
    /// rotation does not stop the write.
    pub fn save(&self, doc: &StateDocument) -> PersistResult<()> {
        let content = serde_json::to_vec_pretty(doc)?;
        let _guard = self.write_lock.lock().map_err(|_| PersistError::LockPoisoned)?;

        if self.needs_rotation(doc.tasks.len()) {
            match rotate_file(&self.path, self.rotation.keep) {
                Ok(()) => info!(
                    path = %self.path.display(),
                    tasks = doc.tasks.len(),
                    "Rotated state file"
                ),
                Err(e) => warn!(error = %e, "State rotation failed, writing in place"),
            }
        }

        write_atomic(&self.path, &content)?;
        debug!(tasks = doc.tasks.len(), "State document saved");
        Ok(())
    }

    fn needs_rotation(&self, task_count: usize) -> bool {
        file_len(&self.path) > self.rotation.max_bytes || task_count > self.rotation.max_entries
    }

    /// Read the current document back. `None` when no state was written yet.
    pub fn load(&self) -> PersistResult<Option<StateDocument>> {
        let content = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistError::io(&self.path, e)),
        };
        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Look up one persisted task.
    pub fn find_task(&self, id: &str) -> PersistResult<Option<Task>> {
        Ok(self.load()?.and_then(|doc| doc.task(id).cloned()))
    }

    /// Index entry for `result`: `sessions/<safe-worker>_<task_id>.json`.
    pub fn session_record(&self, result: &WorkerResult) -> SessionRecord {
        let mut record = SessionRecord {
            worker: result.worker.clone(),
            task_id: result.task_id.clone(),
            path: PathBuf::new(),
            timestamp: result.timestamp,
        };
        record.path = self.sessions_dir.join(format!("{}.json", record.key()));
        record
    }

    /// Persist one successful worker result at its session record path.
    pub fn write_session_record(&self, result: &WorkerResult) -> PersistResult<SessionRecord> {
        let record = self.session_record(result);

        std::fs::create_dir_all(&self.sessions_dir)
            .map_err(|e| PersistError::io(&self.sessions_dir, e))?;
        let content = serde_json::to_vec_pretty(result)?;
        write_atomic(&record.path, &content)?;

        Ok(record)
    }
}
