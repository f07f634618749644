//! Multi-worker task dispatch and consensus
//!
//! This library provides:
//! - Capability routing of free-text tasks to backend workers
//! - Resilient execution with per-attempt timeouts, retry with backoff and
//!   per-worker circuit breakers
//! - Bounded batch scheduling under a task-level timeout
//! - Weighted consensus with freshness decay and outlier dampening
//! - Durable task state and a redacted JSONL audit log
//!
//! # Pipeline
//!
//! ```text
//! request -> Router -> [Assignment] -> BatchScheduler -> ResilientExecutor (per worker)
//!                                                     -> ConsensusAggregator -> TaskReport
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use coordination::{Orchestrator, OrchestratorConfig, Priority, TaskOptions};
//!
//! let orchestrator = Orchestrator::from_config(OrchestratorConfig::load(None)?)?;
//! let report = orchestrator
//!     .orchestrate_task("optimize the parser", Priority::High, TaskOptions::default())
//!     .await?;
//! println!("{}", report.consensus.overall_confidence);
//! ```

pub mod audit;
pub mod backend;
pub mod config;
pub mod consensus;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod scheduler;
pub mod state;

pub use audit::{AuditConfig, AuditLog, Level, SharedAuditLog};
pub use backend::{BackendError, SimulatedBackend, WorkerBackend, WorkerResponse};
pub use config::{ConfigError, OrchestratorConfig};
pub use consensus::{
    Consensus, ConsensusAggregator, ConsensusMethod, PrimaryRecommendation, Recommendation,
};
pub use error::{DispatchError, DispatchResult, PersistError, PersistResult, TimeoutScope};
pub use orchestrator::{Orchestrator, TaskFailure, TaskOptions, TaskReport};
pub use protocol::{handle_line, serve, ErrorResponse, RequestOptions, Response, TaskRequest};
pub use registry::{RegistryError, WorkerMetadata, WorkerProfile, WorkerRegistry};
pub use resilience::{
    BackoffPolicy, CircuitBreaker, CircuitPolicy, CircuitState, ResilientExecutor, RetryPolicy,
    SharedCircuitBreaker,
};
pub use router::{
    Assignment, CapabilityTag, FilePolicySource, KeywordClassifier, PolicySource, Router,
    RoutingPolicy, StaticPolicySource, TagClassifier,
};
pub use scheduler::BatchScheduler;
pub use state::{
    Outcome, Priority, RotationPolicy, StateDocument, Task, TaskId, TaskStateStore, TaskStatus,
    WorkerResult,
};
