//! Resilient worker execution
//!
//! - [`circuit_breaker`]: per-worker failure window and circuit state
//! - [`backoff`]: exponential retry delays with jitter
//! - [`executor`]: one worker call under gating, timeouts and retries
//!
//! The breaker is shared between the executor, which mutates it, and the
//! router, which only asks whether a circuit is open.

pub mod backoff;
pub mod circuit_breaker;
pub mod executor;

use std::sync::{Arc, Mutex};

pub use backoff::{BackoffPolicy, JITTER_CEILING_MS};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitPolicy, CircuitState, HealthWindow, Transition,
};
pub use executor::{elide, ResilientExecutor, RetryPolicy, MAX_TASK_TEXT_BYTES};

/// Circuit breaker shared across tasks. Never held across an `.await`.
pub type SharedCircuitBreaker = Arc<Mutex<CircuitBreaker>>;

/// Wrap a breaker for sharing.
pub fn shared_breaker(policy: CircuitPolicy) -> SharedCircuitBreaker {
    Arc::new(Mutex::new(CircuitBreaker::new(policy)))
}
