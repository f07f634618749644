//! Error types for task dispatch
//!
//! `DispatchError` is the taxonomy every pipeline stage speaks. Persistence
//! has its own [`PersistError`] because state and log writes are advisory:
//! callers log them and carry on, they never reach a task's outcome.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scope of a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    /// A single worker attempt. Retried per policy.
    Attempt,
    /// The whole task. Fatal for that task.
    Task,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attempt => write!(f, "attempt"),
            Self::Task => write!(f, "task"),
        }
    }
}

/// Failures surfaced by the dispatch pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// Rejected before any work started. Never retried.
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{subject} timeout after {}ms", .after.as_millis())]
    Timeout {
        scope: TimeoutScope,
        subject: String,
        after: Duration,
    },

    /// Backend call failed. Retried per policy, counts toward circuit health.
    #[error("Worker {worker} failed: {reason}")]
    WorkerInvocation { worker: String, reason: String },

    /// Fast-fail. Not retried and not counted as a failure.
    #[error("Circuit open for {worker}")]
    CircuitOpen { worker: String },

    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),
}

impl DispatchError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn attempt_timeout(worker: &str, after: Duration) -> Self {
        Self::Timeout {
            scope: TimeoutScope::Attempt,
            subject: format!("Model {worker}"),
            after,
        }
    }

    pub fn task_timeout(after: Duration) -> Self {
        Self::Timeout {
            scope: TimeoutScope::Task,
            subject: "Task".to_string(),
            after,
        }
    }

    /// Machine-readable error code for structured log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Timeout { .. } => "timeout",
            Self::WorkerInvocation { .. } => "worker_invocation",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Aggregation(_) => "aggregation",
            Self::Persistence(_) => "persistence",
        }
    }
}

/// Result alias for the dispatch pipeline.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// State file, session record and audit log failures.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl PersistError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<PersistError> for DispatchError {
    fn from(err: PersistError) -> Self {
        DispatchError::Persistence(err.to_string())
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_matches_wire_format() {
        let err = DispatchError::attempt_timeout("cheetah", Duration::from_millis(30_000));
        assert_eq!(err.to_string(), "Model cheetah timeout after 30000ms");

        let err = DispatchError::task_timeout(Duration::from_millis(300_000));
        assert_eq!(err.to_string(), "Task timeout after 300000ms");
    }

    #[test]
    fn test_circuit_open_message() {
        let err = DispatchError::CircuitOpen {
            worker: "claude-4.5".into(),
        };
        assert_eq!(err.to_string(), "Circuit open for claude-4.5");
        assert_eq!(err.code(), "circuit_open");
    }
}
