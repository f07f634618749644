//! Core types for task state
//!
//! These types live in the orchestrator's task table and are mirrored to the
//! durable state document after every transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consensus::Consensus;
use crate::error::DispatchError;
use crate::registry::WorkerMetadata;

/// Unique identifier for tasks
pub type TaskId = String;

/// Generate a fresh task identifier.
pub fn new_task_id() -> TaskId {
    format!("task_{}", uuid::Uuid::new_v4())
}

/// Caller-supplied task priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err(DispatchError::validation(
                "priority",
                "must be one of low|normal|high.",
            )),
        }
    }
}

/// Status of a task. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Task {id} already in state {from}, cannot transition to {to}")]
pub struct InvalidTransition {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Response from one successful worker invocation. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    /// Worker that produced this result
    #[serde(rename = "model")]
    pub worker: String,

    pub task_id: TaskId,

    pub response: String,

    /// Self-reported confidence, clamped to [0, 1]
    pub confidence: f64,

    pub timestamp: DateTime<Utc>,

    /// Worker metadata at the time of the call
    #[serde(rename = "capabilities")]
    pub metadata: WorkerMetadata,
}

impl WorkerResult {
    pub fn new(
        worker: impl Into<String>,
        task_id: impl Into<TaskId>,
        response: impl Into<String>,
        confidence: f64,
        timestamp: DateTime<Utc>,
        metadata: WorkerMetadata,
    ) -> Self {
        Self {
            worker: worker.into(),
            task_id: task_id.into(),
            response: response.into(),
            confidence: clamp_confidence(confidence),
            timestamp,
            metadata,
        }
    }
}

/// Clamp to [0, 1], mapping NaN to 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Settled outcome of one assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Fulfilled(WorkerResult),
    Rejected {
        worker: String,
        error: DispatchError,
    },
}

impl Outcome {
    pub fn worker(&self) -> &str {
        match self {
            Outcome::Fulfilled(result) => &result.worker,
            Outcome::Rejected { worker, .. } => worker,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Outcome::Fulfilled(_))
    }
}

/// Per-outcome entry recorded on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskResultEntry {
    Success(WorkerResult),
    Failure {
        #[serde(rename = "model")]
        worker: String,
        error: String,
    },
}

impl From<&Outcome> for TaskResultEntry {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Fulfilled(result) => TaskResultEntry::Success(result.clone()),
            Outcome::Rejected { worker, error } => TaskResultEntry::Failure {
                worker: worker.clone(),
                error: error.to_string(),
            },
        }
    }
}

/// A dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "completed", default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Workers chosen by the router, in selection order
    #[serde(rename = "models", default)]
    pub assigned_workers: Vec<String>,
    #[serde(default)]
    pub results: Vec<TaskResultEntry>,
    #[serde(default)]
    pub consensus: Option<Consensus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Create a pending task with a fresh id.
    pub fn new(description: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: new_task_id(),
            description: description.into(),
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            assigned_workers: Vec::new(),
            results: Vec::new(),
            consensus: None,
            error: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// `pending -> completed`, recording consensus and per-outcome results.
    pub fn complete(
        &mut self,
        consensus: Consensus,
        outcomes: &[Outcome],
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Completed)?;
        self.consensus = Some(consensus);
        self.results = outcomes.iter().map(TaskResultEntry::from).collect();
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `pending -> failed`, recording the error message.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }
}
