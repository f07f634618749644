//! Worker backends
//!
//! A backend turns `(worker, task_text)` into a response or a failure. The
//! pipeline never looks past this trait, so real providers, test doubles and
//! the built-in [`SimulatedBackend`] are interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;

/// Raw answer from a backend, before it becomes a `WorkerResult`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub text: String,
    /// Self-reported confidence; clamped by the executor
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl WorkerResponse {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend rejected request: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

/// Asynchronous worker invocation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    async fn invoke(&self, worker: &str, task_text: &str) -> Result<WorkerResponse, BackendError>;
}

/// Placeholder backend that answers every call locally.
///
/// Replies `"Mock response from <worker> for: <task>"` with a confidence
/// drawn from `[0.7, 1.0)`, after an optional artificial latency.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    latency: Duration,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl WorkerBackend for SimulatedBackend {
    async fn invoke(&self, worker: &str, task_text: &str) -> Result<WorkerResponse, BackendError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let confidence = 0.7 + rand::thread_rng().gen::<f64>() * 0.3;
        Ok(WorkerResponse::new(
            format!("Mock response from {worker} for: {task_text}"),
            confidence,
        ))
    }
}
