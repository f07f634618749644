//! Per-worker circuit breaker driven by a sliding failure window.
//!
//! Every failed attempt is timestamped in the worker's [`HealthWindow`].
//! When a call finally gives up, failures older than the window are pruned
//! and the circuit *opens* if enough remain. After the cooldown the circuit
//! turns *half-open* and admits exactly one probe: success closes it, failure
//! re-opens it with a fresh `opened_at`.
//!
//! Times are [`tokio::time::Instant`] so tests can drive the clock.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit breaker state for a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Healthy, requests allowed.
    Closed,
    /// Tripped, requests blocked until cooldown expires.
    Open,
    /// Cooldown expired, one probe request allowed.
    HalfOpen,
}

/// Thresholds for opening and recovering a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitPolicy {
    /// Failures inside `window` needed to open
    pub failure_threshold: usize,
    pub window: Duration,
    /// Time an open circuit waits before admitting a probe
    pub cooldown: Duration,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_millis(120_000),
            cooldown: Duration::from_millis(300_000),
        }
    }
}

/// Recent failure timestamps for one worker.
#[derive(Debug, Clone, Default)]
pub struct HealthWindow {
    failures: Vec<Instant>,
    last_ok: Option<Instant>,
}

impl HealthWindow {
    pub fn record_failure(&mut self, at: Instant) {
        self.failures.push(at);
    }

    pub fn record_success(&mut self, at: Instant) {
        self.failures.clear();
        self.last_ok = Some(at);
    }

    /// Drop failures older than `window` and return how many remain.
    pub fn prune(&mut self, now: Instant, window: Duration) -> usize {
        self.failures
            .retain(|&t| now.saturating_duration_since(t) <= window);
        self.failures.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn last_ok(&self) -> Option<Instant> {
        self.last_ok
    }
}

#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    failure_count: usize,
    opened_at: Instant,
    probe_in_flight: bool,
}

/// Result of asking the breaker for permission to call a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, run the normal retry loop.
    Allowed,
    /// Circuit half-open, this caller is the single probe.
    Probe,
    /// Circuit open (or probe already running), fail fast.
    Rejected,
}

/// A state change worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened { failures: usize },
    Closed,
}

/// Per-worker circuit breaker.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    policy: CircuitPolicy,
    circuits: HashMap<String, Circuit>,
    health: HashMap<String, HealthWindow>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitPolicy) -> Self {
        Self {
            policy,
            circuits: HashMap::new(),
            health: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &CircuitPolicy {
        &self.policy
    }

    /// Gate a call. Moves `open -> half-open` once the cooldown has elapsed
    /// and hands the probe slot to exactly one caller.
    pub fn try_acquire(&mut self, worker: &str, now: Instant) -> Admission {
        let cooldown = self.policy.cooldown;
        let Some(circuit) = self.circuits.get_mut(worker) else {
            return Admission::Allowed;
        };

        match circuit.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                if now.saturating_duration_since(circuit.opened_at) >= cooldown {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    Admission::Rejected
                } else {
                    circuit.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Free the half-open slot without an outcome, so the next caller is
    /// admitted in its place. No-op unless the circuit is half-open with a
    /// call in flight.
    pub fn release_half_open_slot(&mut self, worker: &str) {
        if let Some(circuit) = self.circuits.get_mut(worker) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.probe_in_flight = false;
            }
        }
    }

    /// Whether a call made at `now` would be rejected. Does not transition.
    pub fn is_open(&self, worker: &str, now: Instant) -> bool {
        match self.circuits.get(worker) {
            None => false,
            Some(c) => match c.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    now.saturating_duration_since(c.opened_at) < self.policy.cooldown
                }
                CircuitState::HalfOpen => c.probe_in_flight,
            },
        }
    }

    /// Stored state for `worker`. An open circuit past its cooldown still
    /// reports `Open` until the next [`try_acquire`](Self::try_acquire).
    pub fn state(&self, worker: &str) -> CircuitState {
        self.circuits
            .get(worker)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Timestamp one failed attempt.
    pub fn record_failure(&mut self, worker: &str, now: Instant) {
        self.health
            .entry(worker.to_string())
            .or_default()
            .record_failure(now);
    }

    /// Clear the failure history and close the circuit.
    pub fn record_success(&mut self, worker: &str, now: Instant) -> Option<Transition> {
        self.health
            .entry(worker.to_string())
            .or_default()
            .record_success(now);
        self.circuits
            .remove(worker)
            .map(|_| Transition::Closed)
    }

    /// Evaluate the open policy after a call gave up. A failed probe always
    /// re-opens; otherwise the pruned failure count must reach the threshold.
    pub fn maybe_open(&mut self, worker: &str, now: Instant) -> Option<Transition> {
        let failures = self
            .health
            .entry(worker.to_string())
            .or_default()
            .prune(now, self.policy.window);

        let probe_failed = self
            .circuits
            .get(worker)
            .is_some_and(|c| c.state == CircuitState::HalfOpen);

        if !probe_failed && failures < self.policy.failure_threshold {
            return None;
        }

        self.circuits.insert(
            worker.to_string(),
            Circuit {
                state: CircuitState::Open,
                failure_count: failures,
                opened_at: now,
                probe_in_flight: false,
            },
        );
        Some(Transition::Opened { failures })
    }

    /// Failures currently in the window for `worker`.
    pub fn failure_count(&self, worker: &str) -> usize {
        self.health
            .get(worker)
            .map(HealthWindow::failure_count)
            .unwrap_or(0)
    }

    /// Failure count recorded when the circuit last opened.
    pub fn opened_with(&self, worker: &str) -> Option<usize> {
        self.circuits.get(worker).map(|c| c.failure_count)
    }

    pub fn last_ok(&self, worker: &str) -> Option<Instant> {
        self.health.get(worker).and_then(HealthWindow::last_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CircuitPolicy {
        CircuitPolicy {
            failure_threshold: 3,
            window: Duration::from_secs(120),
            cooldown: Duration::from_secs(300),
        }
    }

    fn fail_times(cb: &mut CircuitBreaker, worker: &str, n: usize, now: Instant) {
        for _ in 0..n {
            cb.record_failure(worker, now);
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new(policy());
        let now = Instant::now();
        assert_eq!(cb.state("cheetah"), CircuitState::Closed);
        assert!(!cb.is_open("cheetah", now));
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let mut cb = CircuitBreaker::new(policy());
        let now = Instant::now();

        fail_times(&mut cb, "cheetah", 2, now);
        assert_eq!(cb.maybe_open("cheetah", now), None);

        cb.record_failure("cheetah", now);
        assert_eq!(
            cb.maybe_open("cheetah", now),
            Some(Transition::Opened { failures: 3 })
        );
        assert_eq!(cb.state("cheetah"), CircuitState::Open);
        assert_eq!(cb.try_acquire("cheetah", now), Admission::Rejected);
        assert!(cb.is_open("cheetah", now));
        assert_eq!(cb.opened_with("cheetah"), Some(3));
    }

    #[test]
    fn test_old_failures_pruned() {
        let mut cb = CircuitBreaker::new(policy());
        let start = Instant::now();
        fail_times(&mut cb, "cheetah", 2, start);

        let later = start + Duration::from_secs(121);
        cb.record_failure("cheetah", later);
        assert_eq!(cb.maybe_open("cheetah", later), None);
        assert_eq!(cb.failure_count("cheetah"), 1);
    }

    #[test]
    fn test_success_closes_circuit() {
        let mut cb = CircuitBreaker::new(policy());
        let now = Instant::now();
        fail_times(&mut cb, "claude-4.5", 3, now);
        cb.maybe_open("claude-4.5", now);

        assert_eq!(cb.record_success("claude-4.5", now), Some(Transition::Closed));
        assert_eq!(cb.state("claude-4.5"), CircuitState::Closed);
        assert_eq!(cb.failure_count("claude-4.5"), 0);
        assert_eq!(cb.last_ok("claude-4.5"), Some(now));
        // Closing an already-closed circuit reports nothing.
        assert_eq!(cb.record_success("claude-4.5", now), None);
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let mut cb = CircuitBreaker::new(policy());
        let start = Instant::now();
        fail_times(&mut cb, "cheetah", 3, start);
        cb.maybe_open("cheetah", start);

        let before = start + Duration::from_secs(299);
        assert_eq!(cb.try_acquire("cheetah", before), Admission::Rejected);

        let after = start + Duration::from_secs(300);
        assert!(!cb.is_open("cheetah", after));
        assert_eq!(cb.try_acquire("cheetah", after), Admission::Probe);
        assert_eq!(cb.state("cheetah"), CircuitState::HalfOpen);

        // Second caller while the probe is running.
        assert_eq!(cb.try_acquire("cheetah", after), Admission::Rejected);
        assert!(cb.is_open("cheetah", after));
    }

    #[test]
    fn test_failed_probe_reopens_with_fresh_timestamp() {
        let mut cb = CircuitBreaker::new(policy());
        let start = Instant::now();
        fail_times(&mut cb, "cheetah", 3, start);
        cb.maybe_open("cheetah", start);

        let probe_at = start + Duration::from_secs(400);
        assert_eq!(cb.try_acquire("cheetah", probe_at), Admission::Probe);
        cb.record_failure("cheetah", probe_at);
        // One failure in the window, but a failed probe re-opens regardless.
        assert_eq!(
            cb.maybe_open("cheetah", probe_at),
            Some(Transition::Opened { failures: 1 })
        );

        let soon = probe_at + Duration::from_secs(10);
        assert_eq!(cb.try_acquire("cheetah", soon), Admission::Rejected);
        let later = probe_at + Duration::from_secs(300);
        assert_eq!(cb.try_acquire("cheetah", later), Admission::Probe);
    }

    #[test]
    fn test_released_slot_admits_next_caller() {
        let mut cb = CircuitBreaker::new(policy());
        let start = Instant::now();
        fail_times(&mut cb, "cheetah", 3, start);
        cb.maybe_open("cheetah", start);

        // Open circuits are left alone.
        cb.release_half_open_slot("cheetah");
        assert_eq!(cb.try_acquire("cheetah", start), Admission::Rejected);

        let after = start + Duration::from_secs(300);
        assert_eq!(cb.try_acquire("cheetah", after), Admission::Probe);
        cb.release_half_open_slot("cheetah");
        assert_eq!(cb.state("cheetah"), CircuitState::HalfOpen);
        assert_eq!(cb.try_acquire("cheetah", after), Admission::Probe);
        assert_eq!(cb.try_acquire("cheetah", after), Admission::Rejected);
    }

    #[test]
    fn test_workers_isolated() {
        let mut cb = CircuitBreaker::new(policy());
        let now = Instant::now();
        fail_times(&mut cb, "cheetah", 3, now);
        cb.maybe_open("cheetah", now);
        assert_eq!(cb.try_acquire("gemini-2.5-flash", now), Admission::Allowed);
    }
}
