//! Consensus aggregation for multi-worker results
//!
//! Combines every settled outcome of a task into one [`Consensus`]:
//!
//! ```text
//! successes | method                          | confidence
//! ----------|---------------------------------|-------------------------------
//! 0         | none                            | 0
//! 1         | single_model                    | that result's confidence
//! 2+        | weighted_reliability_freshness  | Σ(c·w) / Σw, outliers halved
//! ```
//!
//! Weights blend the worker's prior reliability with an exponential
//! freshness decay of the result's age. Results whose confidence sits far
//! from the group median (more than twice the median absolute deviation)
//! keep their vote with half the weight.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::state::{clamp_confidence, Outcome, WorkerResult};

/// Default consensus threshold for the weighted branch.
pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.7;

/// Fixed threshold for the single-result branch.
const SINGLE_MODEL_THRESHOLD: f64 = 0.7;

const RELIABILITY_SHARE: f64 = 0.6;
const FRESHNESS_SHARE: f64 = 0.4;
const OUTLIER_MAD_MULTIPLIER: f64 = 2.0;
const OUTLIER_WEIGHT_FACTOR: f64 = 0.5;

/// How a consensus was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    None,
    SingleModel,
    WeightedReliabilityFreshness,
}

/// What the caller should do with the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Proceed,
    ReviewRequired,
}

/// The top-ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryRecommendation {
    pub worker: String,
    pub response: String,
}

/// Aggregated recommendation for one task. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consensus {
    /// Always within [0, 1]
    pub overall_confidence: f64,
    pub worker_count: usize,
    pub failed_count: usize,
    pub method: ConsensusMethod,
    pub recommendation: Recommendation,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_recommendation: Option<PrimaryRecommendation>,
}

impl Consensus {
    pub fn should_proceed(&self) -> bool {
        self.recommendation == Recommendation::Proceed
    }
}

/// Weight and score computed for one successful result.
#[derive(Debug, Clone)]
pub struct ScoredResult<'a> {
    pub result: &'a WorkerResult,
    pub weight: f64,
    pub score: f64,
    pub dampened: bool,
}

/// `exp(-elapsed / half_life)`, with elapsed floored at zero.
pub fn freshness(result_ts: DateTime<Utc>, now: DateTime<Utc>, half_life_min: f64) -> f64 {
    let elapsed_ms = (now - result_ts).num_milliseconds().max(0) as f64;
    (-elapsed_ms / (half_life_min * 60_000.0)).exp()
}

/// Median of `values`, 0 for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Whether `deviation` marks an outlier given the group's MAD.
///
/// With a zero MAD more than half the group agrees exactly, so any
/// deviation at all is treated as an outlier.
fn is_outlier(deviation: f64, mad: f64) -> bool {
    if mad > 0.0 {
        deviation > OUTLIER_MAD_MULTIPLIER * mad
    } else {
        deviation > f64::EPSILON
    }
}

/// Weight, dampen and rank successful results, best first.
pub fn score_results<'a>(results: &[&'a WorkerResult], now: DateTime<Utc>) -> Vec<ScoredResult<'a>> {
    let confidences: Vec<f64> = results.iter().map(|r| r.confidence).collect();
    let med = median(&confidences);
    let deviations: Vec<f64> = confidences.iter().map(|c| (c - med).abs()).collect();
    let mad = median(&deviations);

    let mut scored: Vec<ScoredResult<'a>> = results
        .iter()
        .zip(deviations)
        .map(|(result, deviation)| {
            let reliability = result.metadata.reliability_or_default();
            let half_life = result.metadata.half_life_or_default();
            let fresh = freshness(result.timestamp, now, half_life);
            let mut weight = RELIABILITY_SHARE * reliability + FRESHNESS_SHARE * fresh;
            let dampened = is_outlier(deviation, mad);
            if dampened {
                weight *= OUTLIER_WEIGHT_FACTOR;
            }
            ScoredResult {
                result,
                weight,
                score: result.confidence * weight,
                dampened,
            }
        })
        .collect();

    scored.sort_by(rank_order);
    scored
}

/// Score descending, then earlier timestamp, then worker name ascending.
fn rank_order(a: &ScoredResult<'_>, b: &ScoredResult<'_>) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.result.timestamp.cmp(&b.result.timestamp))
        .then_with(|| a.result.worker.cmp(&b.result.worker))
}

/// Aggregates settled outcomes into a [`Consensus`].
#[derive(Debug, Clone, Copy)]
pub struct ConsensusAggregator {
    threshold: f64,
}

impl Default for ConsensusAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CONSENSUS_THRESHOLD)
    }
}

impl ConsensusAggregator {
    /// Create an aggregator. A non-finite or non-positive threshold falls
    /// back to [`DEFAULT_CONSENSUS_THRESHOLD`].
    pub fn new(threshold: f64) -> Self {
        let threshold = if threshold.is_finite() && threshold > 0.0 {
            threshold
        } else {
            DEFAULT_CONSENSUS_THRESHOLD
        };
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Aggregate with the current wall clock.
    pub fn aggregate(&self, outcomes: &[Outcome]) -> DispatchResult<Consensus> {
        self.aggregate_at(outcomes, Utc::now())
    }

    /// Aggregate as of `now`.
    pub fn aggregate_at(
        &self,
        outcomes: &[Outcome],
        now: DateTime<Utc>,
    ) -> DispatchResult<Consensus> {
        let successes: Vec<&WorkerResult> = outcomes
            .iter()
            .filter_map(|o| match o {
                Outcome::Fulfilled(r) => Some(r),
                Outcome::Rejected { .. } => None,
            })
            .collect();
        let failed_count = outcomes.len() - successes.len();

        if failed_count > 0 {
            warn!(failed_count, "Some workers failed");
        }

        match successes.as_slice() {
            [] => Ok(Consensus {
                overall_confidence: 0.0,
                worker_count: 0,
                failed_count,
                method: ConsensusMethod::None,
                recommendation: Recommendation::ReviewRequired,
                timestamp: now,
                primary_recommendation: None,
            }),
            [only] => {
                let confidence = clamp_confidence(only.confidence);
                Ok(Consensus {
                    overall_confidence: confidence,
                    worker_count: 1,
                    failed_count,
                    method: ConsensusMethod::SingleModel,
                    recommendation: recommend(confidence, SINGLE_MODEL_THRESHOLD),
                    timestamp: now,
                    primary_recommendation: Some(PrimaryRecommendation {
                        worker: only.worker.clone(),
                        response: only.response.clone(),
                    }),
                })
            }
            many => self.weighted(many, failed_count, now),
        }
    }

    fn weighted(
        &self,
        successes: &[&WorkerResult],
        failed_count: usize,
        now: DateTime<Utc>,
    ) -> DispatchResult<Consensus> {
        let scored = score_results(successes, now);

        let total_weight: f64 = scored.iter().map(|s| s.weight).sum();
        let denominator = if total_weight == 0.0 { 1.0 } else { total_weight };
        let weighted_sum: f64 = scored
            .iter()
            .map(|s| s.result.confidence * s.weight)
            .sum();
        let raw = weighted_sum / denominator;
        if !raw.is_finite() {
            return Err(DispatchError::Aggregation(format!(
                "non-finite weighted confidence from {} results",
                scored.len()
            )));
        }
        let overall_confidence = clamp_confidence(raw);

        let top = scored
            .first()
            .ok_or_else(|| DispatchError::Aggregation("no ranked results".to_string()))?;

        debug!(
            results = scored.len(),
            dampened = scored.iter().filter(|s| s.dampened).count(),
            overall_confidence,
            winner = %top.result.worker,
            "Weighted consensus computed"
        );

        Ok(Consensus {
            overall_confidence,
            worker_count: successes.len(),
            failed_count,
            method: ConsensusMethod::WeightedReliabilityFreshness,
            recommendation: recommend(overall_confidence, self.threshold),
            timestamp: now,
            primary_recommendation: Some(PrimaryRecommendation {
                worker: top.result.worker.clone(),
                response: top.result.response.clone(),
            }),
        })
    }
}

fn recommend(confidence: f64, threshold: f64) -> Recommendation {
    if confidence > threshold {
        Recommendation::Proceed
    } else {
        Recommendation::ReviewRequired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerMetadata;
    use chrono::Duration;

    fn meta(reliability: f64, half_life: f64) -> WorkerMetadata {
        WorkerMetadata {
            reliability: Some(reliability),
            freshness_half_life_min: Some(half_life),
            ..Default::default()
        }
    }

    fn ok(worker: &str, confidence: f64, ts: DateTime<Utc>, metadata: WorkerMetadata) -> Outcome {
        Outcome::Fulfilled(WorkerResult::new(
            worker,
            "task_test",
            format!("answer from {worker}"),
            confidence,
            ts,
            metadata,
        ))
    }

    fn failed(worker: &str) -> Outcome {
        Outcome::Rejected {
            worker: worker.to_string(),
            error: DispatchError::WorkerInvocation {
                worker: worker.to_string(),
                reason: "backend down".to_string(),
            },
        }
    }

    #[test]
    fn test_zero_successes() {
        let agg = ConsensusAggregator::default();
        let c = agg.aggregate(&[failed("a"), failed("b")]).unwrap();
        assert_eq!(c.method, ConsensusMethod::None);
        assert_eq!(c.overall_confidence, 0.0);
        assert_eq!(c.recommendation, Recommendation::ReviewRequired);
        assert_eq!(c.failed_count, 2);
        assert_eq!(c.worker_count, 0);
        assert!(c.primary_recommendation.is_none());
    }

    #[test]
    fn test_empty_outcomes() {
        let c = ConsensusAggregator::default().aggregate(&[]).unwrap();
        assert_eq!(c.method, ConsensusMethod::None);
        assert_eq!(c.failed_count, 0);
    }

    #[test]
    fn test_single_success_thresholds() {
        let now = Utc::now();
        let agg = ConsensusAggregator::default();

        let c = agg
            .aggregate_at(&[ok("a", 0.8, now, meta(0.9, 120.0))], now)
            .unwrap();
        assert_eq!(c.method, ConsensusMethod::SingleModel);
        assert_eq!(c.recommendation, Recommendation::Proceed);
        assert_eq!(c.overall_confidence, 0.8);

        let c = agg
            .aggregate_at(&[ok("a", 0.5, now, meta(0.9, 120.0)), failed("b")], now)
            .unwrap();
        assert_eq!(c.recommendation, Recommendation::ReviewRequired);
        assert_eq!(c.failed_count, 1);
        assert_eq!(c.primary_recommendation.unwrap().worker, "a");
    }

    #[test]
    fn test_single_success_ignores_configured_threshold() {
        let now = Utc::now();
        let agg = ConsensusAggregator::new(0.95);
        let c = agg
            .aggregate_at(&[ok("a", 0.8, now, meta(0.9, 120.0))], now)
            .unwrap();
        assert!(c.should_proceed());
    }

    #[test]
    fn test_weighted_two_workers_same_timestamp() {
        let now = Utc::now();
        let agg = ConsensusAggregator::default();
        let outcomes = vec![
            ok("gpt-5-codex-high", 0.85, now, meta(0.95, 120.0)),
            ok("grok-4-code", 0.75, now, WorkerMetadata::unregistered()),
        ];
        let c = agg.aggregate_at(&outcomes, now).unwrap();

        assert_eq!(c.method, ConsensusMethod::WeightedReliabilityFreshness);
        // weights 0.97 and 0.94
        let expected = (0.85 * 0.97 + 0.75 * 0.94) / (0.97 + 0.94);
        assert!((c.overall_confidence - expected).abs() < 1e-9);
        assert_eq!(c.recommendation, Recommendation::Proceed);
        assert_eq!(c.primary_recommendation.unwrap().worker, "gpt-5-codex-high");
    }

    #[test]
    fn test_exact_tie_breaks_on_name() {
        let now = Utc::now();
        let outcomes = vec![
            ok("zeta", 0.8, now, meta(0.9, 120.0)),
            ok("alpha", 0.8, now, meta(0.9, 120.0)),
        ];
        let c = ConsensusAggregator::default()
            .aggregate_at(&outcomes, now)
            .unwrap();
        assert_eq!(c.primary_recommendation.unwrap().worker, "alpha");
    }

    #[test]
    fn test_tie_breaks_on_earlier_timestamp_before_name() {
        // Half-life is huge so the 1ms age gap cannot change the score.
        let now = Utc::now();
        let earlier = now - Duration::milliseconds(1);
        let results = [
            WorkerResult::new("alpha", "t", "a", 0.8, now, meta(0.9, 1e12)),
            WorkerResult::new("zeta", "t", "z", 0.8, earlier, meta(0.9, 1e12)),
        ];
        let refs: Vec<&WorkerResult> = results.iter().collect();
        let scored = score_results(&refs, now);
        if scored[0].score == scored[1].score {
            assert_eq!(scored[0].result.worker, "zeta");
        }
    }

    #[test]
    fn test_outlier_dampening_reduces_outlier_contribution() {
        let now = Utc::now();
        let outcomes = vec![
            ok("a", 0.9, now, meta(0.9, 120.0)),
            ok("b", 0.9, now, meta(0.9, 120.0)),
            ok("c", 0.1, now, meta(0.9, 120.0)),
        ];
        let c = ConsensusAggregator::default()
            .aggregate_at(&outcomes, now)
            .unwrap();

        // All weights equal (0.94) without dampening.
        let undamped = (0.9 + 0.9 + 0.1) / 3.0;
        assert!(c.overall_confidence > undamped);

        let w = 0.94;
        let expected = (0.9 * w + 0.9 * w + 0.1 * w * 0.5) / (w + w + w * 0.5);
        assert!((c.overall_confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_outlier_with_positive_mad() {
        let now = Utc::now();
        let results = [
            WorkerResult::new("a", "t", "", 0.80, now, meta(0.9, 120.0)),
            WorkerResult::new("b", "t", "", 0.82, now, meta(0.9, 120.0)),
            WorkerResult::new("c", "t", "", 0.78, now, meta(0.9, 120.0)),
            WorkerResult::new("d", "t", "", 0.81, now, meta(0.9, 120.0)),
            WorkerResult::new("e", "t", "", 0.10, now, meta(0.9, 120.0)),
        ];
        let refs: Vec<&WorkerResult> = results.iter().collect();
        let scored = score_results(&refs, now);
        let dampened: Vec<&str> = scored
            .iter()
            .filter(|s| s.dampened)
            .map(|s| s.result.worker.as_str())
            .collect();
        assert_eq!(dampened, vec!["e"]);
        let e = scored.iter().find(|s| s.result.worker == "e").unwrap();
        assert!((e.weight - 0.94 * 0.5).abs() < 1e-9);
        assert!((e.score - 0.10 * e.weight).abs() < 1e-12);
    }

    #[test]
    fn test_unanimous_results_not_dampened() {
        let now = Utc::now();
        let results = [
            WorkerResult::new("a", "t", "", 0.7, now, meta(0.9, 120.0)),
            WorkerResult::new("b", "t", "", 0.7, now, meta(0.9, 120.0)),
        ];
        let refs: Vec<&WorkerResult> = results.iter().collect();
        assert!(score_results(&refs, now).iter().all(|s| !s.dampened));
    }

    #[test]
    fn test_freshness_decay() {
        let now = Utc::now();
        assert_eq!(freshness(now, now, 120.0), 1.0);
        // Future timestamps are floored at zero elapsed.
        assert_eq!(freshness(now + Duration::minutes(5), now, 120.0), 1.0);
        let aged = freshness(now - Duration::minutes(120), now, 120.0);
        assert!((aged - (-1.0f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn test_stale_result_loses_rank() {
        let now = Utc::now();
        let outcomes = vec![
            ok("stale", 0.8, now - Duration::hours(10), meta(0.9, 60.0)),
            ok("fresh", 0.8, now, meta(0.9, 60.0)),
        ];
        let c = ConsensusAggregator::default()
            .aggregate_at(&outcomes, now)
            .unwrap();
        assert_eq!(c.primary_recommendation.unwrap().worker, "fresh");
    }

    #[test]
    fn test_overall_confidence_always_in_unit_range() {
        let now = Utc::now();
        let agg = ConsensusAggregator::default();
        let grid = [0.0, 0.05, 0.3, 0.5, 0.7, 0.71, 0.99, 1.0];
        for &a in &grid {
            for &b in &grid {
                for &c in &grid {
                    let outcomes = vec![
                        ok("a", a, now, meta(0.97, 120.0)),
                        ok("b", b, now - Duration::minutes(30), meta(0.9, 60.0)),
                        ok("c", c, now, WorkerMetadata::default()),
                        failed("d"),
                    ];
                    let consensus = agg.aggregate_at(&outcomes, now).unwrap();
                    assert!((0.0..=1.0).contains(&consensus.overall_confidence));
                    assert_eq!(consensus.failed_count, 1);
                    assert_eq!(consensus.worker_count, 3);
                }
            }
        }
    }

    #[test]
    fn test_threshold_fallback() {
        assert_eq!(ConsensusAggregator::new(f64::NAN).threshold(), 0.7);
        assert_eq!(ConsensusAggregator::new(0.0).threshold(), 0.7);
        assert_eq!(ConsensusAggregator::new(0.85).threshold(), 0.85);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), 0.0);
        assert_eq!(median(&[0.3]), 0.3);
        assert_eq!(median(&[0.9, 0.1, 0.5]), 0.5);
        assert_eq!(median(&[0.2, 0.4, 0.6, 0.8]), 0.5);
    }

    #[test]
    fn test_consensus_json_shape() {
        let now = Utc::now();
        let c = ConsensusAggregator::default()
            .aggregate_at(&[ok("a", 0.9, now, meta(0.9, 120.0))], now)
            .unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["method"], "single_model");
        assert_eq!(json["recommendation"], "proceed");
        assert_eq!(json["workerCount"], 1);
        assert_eq!(json["primaryRecommendation"]["worker"], "a");
    }
}
