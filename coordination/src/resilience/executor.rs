//! Runs one worker invocation under circuit gating, per-attempt timeouts and
//! retry with backoff.

use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::circuit_breaker::{Admission, CircuitBreaker, Transition};
use super::SharedCircuitBreaker;
use crate::audit::SharedAuditLog;
use crate::backend::WorkerBackend;
use crate::error::{DispatchError, DispatchResult};
use crate::registry::WorkerRegistry;
use crate::state::{SharedStateStore, WorkerResult};

/// Task text longer than this is cut down before it reaches a backend.
pub const MAX_TASK_TEXT_BYTES: usize = 64 * 1024;

/// Retry settings for one worker call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            attempt_timeout: Duration::from_millis(30_000),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Cut `text` to at most `max` bytes on a char boundary, ending in `...`.
pub fn elide(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max.saturating_sub(3);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Holds a half-open admission until the call settles. Dropped while still
/// armed (panic or cancellation), it frees the slot for the next caller.
struct HalfOpenSlot<'a> {
    breaker: &'a SharedCircuitBreaker,
    worker: &'a str,
    armed: bool,
}

impl<'a> HalfOpenSlot<'a> {
    fn new(breaker: &'a SharedCircuitBreaker, worker: &'a str, admission: Admission) -> Self {
        Self {
            breaker,
            worker,
            armed: admission == Admission::Probe,
        }
    }

    fn settle(&mut self) {
        self.armed = false;
    }
}

impl Drop for HalfOpenSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(worker = self.worker, "Half-open call ended without an outcome");
            self.breaker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release_half_open_slot(self.worker);
        }
    }
}

/// Executes worker calls on behalf of the scheduler.
pub struct ResilientExecutor {
    backend: Arc<dyn WorkerBackend>,
    registry: Arc<WorkerRegistry>,
    breaker: SharedCircuitBreaker,
    retry: RetryPolicy,
    audit: SharedAuditLog,
    sessions: Option<SharedStateStore>,
}

impl ResilientExecutor {
    pub fn new(
        backend: Arc<dyn WorkerBackend>,
        registry: Arc<WorkerRegistry>,
        breaker: SharedCircuitBreaker,
        retry: RetryPolicy,
        audit: SharedAuditLog,
    ) -> Self {
        Self {
            backend,
            registry,
            breaker,
            retry,
            audit,
            sessions: None,
        }
    }

    /// Persist a session record for every successful result.
    pub fn with_session_store(mut self, store: SharedStateStore) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn circuit_breaker(&self) -> &SharedCircuitBreaker {
        &self.breaker
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `sub_task` on `worker`.
    ///
    /// A closed circuit gets up to `max_retries + 1` attempts; a half-open
    /// probe gets exactly one. An open circuit fails immediately without
    /// touching the backend or the failure history.
    pub async fn execute(
        &self,
        worker: &str,
        sub_task: &str,
        task_id: &str,
    ) -> DispatchResult<WorkerResult> {
        let admission = self.breaker().try_acquire(worker, Instant::now());
        let max_attempts = match admission {
            Admission::Rejected => {
                warn!(task_id, worker, "Circuit open, skipping worker");
                self.audit.warn(
                    "model_skipped_circuit_open",
                    json!({ "taskId": task_id, "model": worker }),
                );
                return Err(DispatchError::CircuitOpen {
                    worker: worker.to_string(),
                });
            }
            Admission::Probe => {
                info!(task_id, worker, "Circuit half-open, sending probe");
                1
            }
            Admission::Allowed => self.retry.max_retries + 1,
        };

        let mut slot = HalfOpenSlot::new(&self.breaker, worker, admission);
        let task_text = elide(sub_task, MAX_TASK_TEXT_BYTES);
        self.audit.info(
            "model_consult_started",
            json!({ "taskId": task_id, "model": worker, "maxAttempts": max_attempts }),
        );

        let mut last_error = None;
        for attempt in 0..max_attempts {
            let error = match timeout(
                self.retry.attempt_timeout,
                self.backend.invoke(worker, &task_text),
            )
            .await
            {
                Ok(Ok(response)) => {
                    let result = WorkerResult::new(
                        worker,
                        task_id,
                        response.text,
                        response.confidence,
                        response.timestamp,
                        self.registry.snapshot(worker),
                    );
                    self.on_success(&result, attempt);
                    slot.settle();
                    return Ok(result);
                }
                Ok(Err(e)) => DispatchError::WorkerInvocation {
                    worker: worker.to_string(),
                    reason: e.to_string(),
                },
                Err(_) => DispatchError::attempt_timeout(worker, self.retry.attempt_timeout),
            };

            self.breaker().record_failure(worker, Instant::now());
            warn!(task_id, worker, attempt, error = %error, "Worker attempt failed");
            self.audit.warn(
                "model_consult_failed",
                json!({
                    "taskId": task_id,
                    "model": worker,
                    "attempt": attempt,
                    "error": error.to_string(),
                }),
            );
            last_error = Some(error);

            if attempt + 1 < max_attempts {
                let delay = self.retry.backoff.delay(attempt);
                debug!(task_id, worker, delay_ms = delay.as_millis() as u64, "Backing off");
                sleep(delay).await;
            }
        }

        let transition = self.breaker().maybe_open(worker, Instant::now());
        slot.settle();
        if let Some(Transition::Opened { failures }) = transition {
            warn!(worker, failures, "Circuit opened");
            self.audit.warn(
                "circuit_opened",
                json!({ "model": worker, "failures": failures }),
            );
        }

        Err(last_error.unwrap_or_else(|| DispatchError::WorkerInvocation {
            worker: worker.to_string(),
            reason: "no attempts made".to_string(),
        }))
    }

    fn on_success(&self, result: &WorkerResult, attempt: u32) {
        let transition = self.breaker().record_success(&result.worker, Instant::now());
        if transition == Some(Transition::Closed) {
            info!(worker = %result.worker, "Circuit closed");
            self.audit
                .info("circuit_closed", json!({ "model": result.worker }));
        }

        info!(
            task_id = %result.task_id,
            worker = %result.worker,
            attempt,
            confidence = result.confidence,
            "Worker answered"
        );
        self.audit.info(
            "model_consult_finished",
            json!({
                "taskId": result.task_id,
                "model": result.worker,
                "attempt": attempt,
                "confidence": result.confidence,
            }),
        );

        if let Some(store) = &self.sessions {
            if let Err(e) = store.write_session_record(result) {
                warn!(worker = %result.worker, error = %e, "Failed to write session record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::backend::{BackendError, MockWorkerBackend, WorkerResponse};
    use crate::resilience::circuit_breaker::{CircuitPolicy, CircuitState};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            attempt_timeout: Duration::from_millis(30_000),
            backoff: BackoffPolicy::default(),
        }
    }

    fn executor(backend: impl WorkerBackend + 'static) -> ResilientExecutor {
        ResilientExecutor::new(
            Arc::new(backend),
            Arc::new(WorkerRegistry::with_builtin()),
            Arc::new(Mutex::new(CircuitBreaker::new(CircuitPolicy::default()))),
            retry(),
            Arc::new(AuditLog::disabled()),
        )
    }

    fn failing_mock(times: usize) -> MockWorkerBackend {
        let mut mock = MockWorkerBackend::new();
        mock.expect_invoke()
            .times(times)
            .returning(|_, _| Err(BackendError::Unavailable("503".into())));
        mock
    }

    #[test]
    fn test_elide() {
        assert_eq!(elide("short", 10), "short");
        assert_eq!(elide("abcdefghijkl", 8), "abcde...");
        // Never splits a multi-byte char.
        let text = "é".repeat(10);
        let out = elide(&text, 8);
        assert!(out.len() <= 8);
        assert!(out.ends_with("..."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries() {
        let mut mock = MockWorkerBackend::new();
        let mut calls = 0;
        mock.expect_invoke().times(3).returning(move |_, _| {
            calls += 1;
            if calls < 3 {
                Err(BackendError::Unavailable("busy".into()))
            } else {
                Ok(WorkerResponse::new("done", 1.4))
            }
        });
        let exec = executor(mock);

        let result = exec.execute("cheetah", "Performance: x", "task_1").await.unwrap();
        assert_eq!(result.response, "done");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.metadata.reliability, Some(0.90));
        // Success clears the history.
        assert_eq!(exec.breaker().failure_count("cheetah"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_opens_circuit_and_fast_fails() {
        let exec = executor(failing_mock(3));

        let err = exec.execute("cheetah", "x", "task_1").await.unwrap_err();
        assert!(matches!(err, DispatchError::WorkerInvocation { .. }));
        assert_eq!(exec.breaker().state("cheetah"), CircuitState::Open);

        // The mock would panic on a fourth call.
        let err = exec.execute("cheetah", "x", "task_2").await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::CircuitOpen {
                worker: "cheetah".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_gets_single_attempt() {
        let exec = executor(failing_mock(4));

        exec.execute("cheetah", "x", "task_1").await.unwrap_err();
        tokio::time::advance(CircuitPolicy::default().cooldown).await;

        let err = exec.execute("cheetah", "x", "task_2").await.unwrap_err();
        assert!(matches!(err, DispatchError::WorkerInvocation { .. }));
        assert_eq!(exec.breaker().state("cheetah"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_closes_circuit() {
        let mut mock = MockWorkerBackend::new();
        let mut calls = 0;
        mock.expect_invoke().times(4).returning(move |_, _| {
            calls += 1;
            if calls <= 3 {
                Err(BackendError::Other("boom".into()))
            } else {
                Ok(WorkerResponse::new("recovered", 0.8))
            }
        });
        let exec = executor(mock);

        exec.execute("cheetah", "x", "task_1").await.unwrap_err();
        tokio::time::advance(CircuitPolicy::default().cooldown).await;

        let result = exec.execute("cheetah", "x", "task_2").await.unwrap();
        assert_eq!(result.response, "recovered");
        assert_eq!(exec.breaker().state("cheetah"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_between_attempts() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&stamps);
        let mut mock = MockWorkerBackend::new();
        mock.expect_invoke().times(3).returning(move |_, _| {
            recorder.lock().unwrap().push(Instant::now());
            Err(BackendError::Unavailable("down".into()))
        });
        let exec = executor(mock);

        exec.execute("gpt-5-codex-high", "x", "task_1").await.unwrap_err();

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        let first = stamps[1] - stamps[0];
        let second = stamps[2] - stamps[1];
        assert!(first >= Duration::from_millis(500) && first < Duration::from_millis(750));
        assert!(second >= Duration::from_millis(1000) && second < Duration::from_millis(1250));
    }

    struct HangingBackend;

    #[async_trait]
    impl WorkerBackend for HangingBackend {
        async fn invoke(&self, _: &str, _: &str) -> Result<WorkerResponse, BackendError> {
            sleep(Duration::from_secs(3600)).await;
            Ok(WorkerResponse::new("too late", 0.9))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let exec = executor(HangingBackend);

        let err = exec.execute("claude-4.5", "x", "task_1").await.unwrap_err();
        assert_eq!(err.to_string(), "Model claude-4.5 timeout after 30000ms");
        assert_eq!(exec.breaker().state("claude-4.5"), CircuitState::Open);
        assert_eq!(exec.breaker().opened_with("claude-4.5"), Some(3));
    }

    /// Fails three times, then panics.
    #[derive(Default)]
    struct CrashingBackend {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl WorkerBackend for CrashingBackend {
        async fn invoke(&self, _: &str, _: &str) -> Result<WorkerResponse, BackendError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call < 3 {
                return Err(BackendError::Unavailable("down".into()));
            }
            panic!("backend crashed");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_half_open_call_frees_slot() {
        let exec = Arc::new(executor(CrashingBackend::default()));

        exec.execute("cheetah", "x", "task_1").await.unwrap_err();
        tokio::time::advance(CircuitPolicy::default().cooldown).await;

        let crashed = {
            let exec = Arc::clone(&exec);
            tokio::spawn(async move { exec.execute("cheetah", "x", "task_2").await })
        };
        assert!(crashed.await.unwrap_err().is_panic());

        let now = Instant::now();
        assert_eq!(exec.breaker().state("cheetah"), CircuitState::HalfOpen);
        assert!(!exec.breaker().is_open("cheetah", now));
        assert_eq!(exec.breaker().try_acquire("cheetah", now), Admission::Probe);
    }

    #[tokio::test]
    async fn test_session_record_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::state::TaskStateStore::new(
            dir.path(),
            crate::state::RotationPolicy::STATE,
        )
        .shared();

        let mut mock = MockWorkerBackend::new();
        mock.expect_invoke()
            .times(1)
            .returning(|_, _| Ok(WorkerResponse::new("ok", 0.9)));
        let exec = executor(mock).with_session_store(store);

        exec.execute("claude-4.5", "x", "task_9").await.unwrap();
        assert!(dir.path().join("sessions").join("claude-4.5_task_9.json").exists());
    }
}
