//! Exponential backoff with additive jitter

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Jitter is drawn uniformly from `[0, JITTER_CEILING_MS)`.
pub const JITTER_CEILING_MS: u64 = 250;

/// `min(max, base * factor^attempt) + jitter`, attempt zero-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_millis(15_000),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = base_ms * self.factor.powi(exp);
        let ms = if scaled.is_finite() { scaled.min(max_ms) } else { max_ms };
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Delay before retry `attempt`, jitter included when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter {
            delay + Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_CEILING_MS))
        } else {
            delay
        }
    }
}
