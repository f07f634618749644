//! Task orchestration
//!
//! Drives one task through the full pipeline:
//!
//! ```text
//! validate -> route -> batch execute (task timeout) -> aggregate -> persist
//! ```
//!
//! The task table is mirrored to the state document after every
//! transition, and every step emits an audit line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::audit::{AuditConfig, AuditLog, SharedAuditLog};
use crate::backend::{SimulatedBackend, WorkerBackend};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::consensus::{Consensus, ConsensusAggregator};
use crate::error::DispatchError;
use crate::registry::WorkerRegistry;
use crate::resilience::{elide, shared_breaker, ResilientExecutor, SharedCircuitBreaker};
use crate::router::{FilePolicySource, PolicySource, Router};
use crate::scheduler::BatchScheduler;
use crate::state::{
    Outcome, Priority, SessionRecord, SharedStateStore, StateDocument, Task, TaskId, TaskStateStore,
    TaskStatus,
};

/// Description length kept in the `task_started` audit line.
const LOGGED_DESCRIPTION_BYTES: usize = 1024;

/// Per-task overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    pub task_timeout: Option<Duration>,
    pub max_concurrency: Option<usize>,
}

/// Returned for a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: TaskId,
    pub consensus: Consensus,
    /// Number of settled outcomes
    pub results: usize,
}

/// A task that did not complete. `task_id` is absent when validation failed
/// before an id was assigned.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{error}")]
pub struct TaskFailure {
    pub task_id: Option<TaskId>,
    pub error: DispatchError,
}

impl TaskFailure {
    fn rejected(error: DispatchError) -> Self {
        Self {
            task_id: None,
            error,
        }
    }
}

/// In-memory task table, ordered by creation.
#[derive(Debug, Default)]
struct TaskTable {
    order: Vec<TaskId>,
    by_id: HashMap<TaskId, Task>,
    sessions: Vec<(String, SessionRecord)>,
}

impl TaskTable {
    fn insert(&mut self, task: Task) {
        if !self.by_id.contains_key(&task.id) {
            self.order.push(task.id.clone());
        }
        self.by_id.insert(task.id.clone(), task);
    }

    fn ordered(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    fn snapshot(&self) -> StateDocument {
        StateDocument::new(
            self.sessions.clone(),
            self.ordered().map(|t| (t.id.clone(), t.clone())).collect(),
        )
    }
}

/// Multi-worker task orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<WorkerRegistry>,
    router: Router,
    executor: Arc<ResilientExecutor>,
    breaker: SharedCircuitBreaker,
    tasks: RwLock<TaskTable>,
    store: SharedStateStore,
    audit: SharedAuditLog,
}

impl Orchestrator {
    /// Start with the simulated backend and the policy file from `config`.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, ConfigError> {
        let policy = Arc::new(FilePolicySource::new(config.mcp_config_path()));
        Self::new(config, Arc::new(SimulatedBackend::new()), policy)
    }

    /// Prepare directories and baseline files, then wire every component.
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn WorkerBackend>,
        policy: Arc<dyn PolicySource>,
    ) -> Result<Self, ConfigError> {
        config.ensure_directories()?;

        let store = TaskStateStore::new(config.coordination_dir(), config.state_rotation()).shared();
        store.ensure_baseline()?;

        let audit = AuditLog::new(AuditConfig {
            path: config.log_dir().join(crate::audit::LOG_FILE_NAME),
            enabled: config.log_jsonl,
            redact: config.log_redact,
            rotation: config.log_rotation(),
        })
        .shared();
        audit.ensure_file()?;

        let registry = Arc::new(WorkerRegistry::with_builtin());
        let breaker = shared_breaker(config.circuit_policy());
        let router = Router::new(policy, Arc::clone(&breaker));
        let executor = ResilientExecutor::new(
            backend,
            Arc::clone(&registry),
            Arc::clone(&breaker),
            config.retry_policy(),
            Arc::clone(&audit),
        )
        .with_session_store(Arc::clone(&store));

        let table = Self::restore(&store);

        info!(
            coordination_dir = %config.coordination_dir().display(),
            workers = registry.len(),
            restored_tasks = table.order.len(),
            "Orchestrator ready"
        );

        Ok(Self {
            config,
            registry,
            router,
            executor: Arc::new(executor),
            breaker,
            tasks: RwLock::new(table),
            store,
            audit,
        })
    }

    /// Seed the task table from the last state document. Tasks left pending
    /// by a previous process can never finish and are marked failed.
    fn restore(store: &TaskStateStore) -> TaskTable {
        let mut table = TaskTable::default();
        match store.load() {
            Ok(Some(doc)) => {
                table.sessions = doc.sessions;
                for (_, mut task) in doc.tasks {
                    if task.status == TaskStatus::Pending {
                        let _ = task.fail("Interrupted before completion");
                    }
                    table.insert(task);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read previous state, starting empty"),
        }
        table
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn circuit_breaker(&self) -> &SharedCircuitBreaker {
        &self.breaker
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    pub fn audit(&self) -> &SharedAuditLog {
        &self.audit
    }

    /// Run `description` across the routed workers and aggregate a consensus.
    pub async fn orchestrate_task(
        &self,
        description: &str,
        priority: Priority,
        options: TaskOptions,
    ) -> Result<TaskReport, TaskFailure> {
        let started = StdInstant::now();
        if description.trim().is_empty() {
            return Err(TaskFailure::rejected(DispatchError::validation(
                "taskDescription",
                "must be a non-empty string.",
            )));
        }

        let mut task = Task::new(description, priority);
        let task_id = task.id.clone();
        self.upsert(task.clone()).await;

        let policy = self.router.load_policy();
        let assignments = self
            .router
            .route_with_policy(description, priority, &policy);
        task.assigned_workers = assignments.iter().map(|a| a.worker.clone()).collect();
        self.upsert(task.clone()).await;

        info!(task_id = %task_id, %priority, workers = ?task.assigned_workers, "Task started");
        self.audit.info(
            "task_started",
            json!({
                "taskId": task_id,
                "priority": priority,
                "description": elide(description, LOGGED_DESCRIPTION_BYTES),
                "models": task.assigned_workers,
            }),
        );

        let scheduler = BatchScheduler::new(
            Arc::clone(&self.executor),
            options.max_concurrency.unwrap_or(self.config.max_concurrency),
        );
        let task_timeout = options.task_timeout.unwrap_or_else(|| self.config.task_timeout());

        let outcomes =
            match tokio::time::timeout(task_timeout, scheduler.run(&task_id, &assignments)).await {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    return Err(self
                        .fail(task, DispatchError::task_timeout(task_timeout))
                        .await)
                }
            };

        let failed = outcomes.iter().filter(|o| !o.is_fulfilled()).count();
        if failed > 0 {
            self.audit.warn(
                "some_models_failed",
                json!({ "taskId": task_id, "failedCount": failed, "total": outcomes.len() }),
            );
        }

        let aggregator = ConsensusAggregator::new(policy.consensus_threshold);
        let consensus = match aggregator.aggregate(&outcomes) {
            Ok(consensus) => consensus,
            Err(e) => return Err(self.fail(task, e).await),
        };

        if let Err(e) = task.complete(consensus.clone(), &outcomes) {
            return Err(self.fail(task, DispatchError::Aggregation(e.to_string())).await);
        }
        self.record_sessions(&outcomes).await;
        self.upsert(task).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            task_id = %task_id,
            confidence = consensus.overall_confidence,
            recommendation = ?consensus.recommendation,
            duration_ms,
            "Task completed"
        );
        self.audit.info(
            "consensus_finalized",
            json!({ "taskId": task_id, "consensus": consensus, "durationMs": duration_ms }),
        );
        self.audit.info("task_completed", json!({ "taskId": task_id }));

        Ok(TaskReport {
            task_id,
            consensus,
            results: outcomes.len(),
        })
    }

    async fn fail(&self, mut task: Task, error: DispatchError) -> TaskFailure {
        let message = error.to_string();
        if let Err(e) = task.fail(message.clone()) {
            warn!(task_id = %task.id, error = %e, "Task already settled");
        }
        let task_id = task.id.clone();
        self.upsert(task).await;

        error!(task_id = %task_id, error = %message, "Task failed");
        self.audit.error(
            "task_failed",
            json!({ "taskId": task_id, "error": message, "code": error.code() }),
        );

        TaskFailure {
            task_id: Some(task_id),
            error,
        }
    }

    async fn record_sessions(&self, outcomes: &[Outcome]) {
        let records: Vec<(String, SessionRecord)> = outcomes
            .iter()
            .filter_map(|o| match o {
                Outcome::Fulfilled(result) => {
                    let record = self.store.session_record(result);
                    Some((record.key(), record))
                }
                Outcome::Rejected { .. } => None,
            })
            .collect();
        self.tasks.write().await.sessions.extend(records);
    }

    /// Replace the task in the table and mirror the table to disk. The write
    /// guard is held through the save so snapshots land in table order.
    async fn upsert(&self, task: Task) {
        let mut table = self.tasks.write().await;
        table.insert(task);
        if let Err(e) = self.store.save(&table.snapshot()) {
            warn!(error = %e, "Failed to persist task state");
        }
    }

    /// Current record for `task_id`.
    pub async fn task_status(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.by_id.get(task_id).cloned()
    }

    /// Tasks still pending.
    pub async fn active_tasks(&self) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .ordered()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect()
    }

    /// Every known task in creation order.
    pub async fn tasks(&self) -> Vec<Task> {
        self.tasks.read().await.ordered().cloned().collect()
    }
}
