//! Task state and its durable mirror
//!
//! - [`types`]: tasks, worker results and settled outcomes
//! - [`store`]: the JSON state document, rewritten atomically and rotated
//! - [`files`]: atomic write and rotation helpers shared with the audit log
//!
//! # Usage
//!
//! ```ignore
//! use coordination::state::{RotationPolicy, StateDocument, TaskStateStore};
//!
//! let store = TaskStateStore::new("./.ai-coordination", RotationPolicy::STATE);
//! store.ensure_baseline()?;
//! let doc = store.load()?.unwrap_or_else(StateDocument::empty);
//! ```

pub mod files;
pub mod store;
pub mod types;

pub use store::{
    RotationPolicy, SessionRecord, SharedStateStore, StateDocument, TaskStateStore,
    SCHEMA_VERSION, STATE_FILE_NAME,
};
pub use types::{
    clamp_confidence, new_task_id, InvalidTransition, Outcome, Priority, Task, TaskId,
    TaskResultEntry, TaskStatus, WorkerResult,
};
