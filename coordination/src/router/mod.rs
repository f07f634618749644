//! Worker Router Module
//!
//! Maps a task description to an ordered list of worker assignments:
//!
//! ```text
//! Step        | Source                          | Sub-task text
//! ------------|---------------------------------|------------------------------
//! Primary     | policy.modelRouting[tag]        | "<Tag>: <description>"
//! Fallback    | policy.fallbackMapping[tag]     | "Fallback <Tag>: <description>"
//! Alternative | gemini-2.5-flash, priority low  | "Alternative Analysis: <description>"
//! ```
//!
//! Workers with an open circuit are skipped, a worker is never assigned
//! twice, and at most [`MAX_ASSIGNMENTS`] survive.

pub mod classifier;
pub mod policy;

use std::collections::HashSet;
use std::sync::{Arc, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::resilience::SharedCircuitBreaker;
use crate::state::Priority;

pub use classifier::{CapabilityTag, KeywordClassifier, TagClassifier};
pub use policy::{FilePolicySource, PolicySource, RoutingPolicy, StaticPolicySource};

/// Upper bound on assignments per task.
pub const MAX_ASSIGNMENTS: usize = 4;

/// Fallback tables are tried in this order when primary routing is empty.
pub const FALLBACK_TAGS: [&str; 3] = ["reasoning", "analysis", "implementation"];

/// Worker force-included when nothing else is available.
pub const ALTERNATIVE_WORKER: &str = "gemini-2.5-flash";

/// One worker's share of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    #[serde(rename = "model")]
    pub worker: String,
    #[serde(rename = "task")]
    pub sub_task: String,
    pub priority: Priority,
}

fn capitalize(tag: &str) -> String {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Policy-driven, circuit-aware router.
pub struct Router {
    classifier: Box<dyn TagClassifier>,
    policy: Arc<dyn PolicySource>,
    breaker: SharedCircuitBreaker,
}

impl Router {
    pub fn new(policy: Arc<dyn PolicySource>, breaker: SharedCircuitBreaker) -> Self {
        Self {
            classifier: Box::new(KeywordClassifier::new()),
            policy,
            breaker,
        }
    }

    pub fn with_classifier(mut self, classifier: impl TagClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    /// Read the current policy from the source.
    pub fn load_policy(&self) -> RoutingPolicy {
        self.policy.load()
    }

    pub fn classify(&self, description: &str) -> Vec<CapabilityTag> {
        self.classifier.classify(description)
    }

    /// Route with a freshly loaded policy.
    pub fn route(&self, description: &str, priority: Priority) -> Vec<Assignment> {
        let policy = self.load_policy();
        self.route_with_policy(description, priority, &policy)
    }

    /// Route against an already loaded policy.
    pub fn route_with_policy(
        &self,
        description: &str,
        priority: Priority,
        policy: &RoutingPolicy,
    ) -> Vec<Assignment> {
        let tags = self.classify(description);
        let now = Instant::now();
        let breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);

        let mut seen: HashSet<&str> = HashSet::new();
        let mut assignments = Vec::new();

        for tag in &tags {
            for worker in policy.workers_for(tag.as_str()) {
                if !seen.contains(worker.as_str()) && !breaker.is_open(worker, now) {
                    seen.insert(worker);
                    assignments.push(Assignment {
                        worker: worker.clone(),
                        sub_task: format!("{}: {}", capitalize(tag.as_str()), description),
                        priority,
                    });
                }
            }
        }

        if assignments.is_empty() {
            for tag in FALLBACK_TAGS {
                for worker in policy.fallbacks_for(tag) {
                    if !seen.contains(worker.as_str()) && !breaker.is_open(worker, now) {
                        seen.insert(worker);
                        assignments.push(Assignment {
                            worker: worker.clone(),
                            sub_task: format!("Fallback {}: {}", capitalize(tag), description),
                            priority,
                        });
                    }
                }
                if !assignments.is_empty() {
                    break;
                }
            }
        }

        if assignments.is_empty() && !breaker.is_open(ALTERNATIVE_WORKER, now) {
            assignments.push(Assignment {
                worker: ALTERNATIVE_WORKER.to_string(),
                sub_task: format!("Alternative Analysis: {description}"),
                priority: Priority::Low,
            });
        }

        assignments.truncate(MAX_ASSIGNMENTS);

        debug!(
            tags = ?tags,
            workers = ?assignments.iter().map(|a| a.worker.as_str()).collect::<Vec<_>>(),
            "Routed task"
        );
        assignments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{shared_breaker, CircuitPolicy};
    use std::collections::HashMap;

    fn router_with(policy: RoutingPolicy) -> (Router, SharedCircuitBreaker) {
        let breaker = shared_breaker(CircuitPolicy::default());
        let router = Router::new(
            Arc::new(StaticPolicySource::new(policy)),
            Arc::clone(&breaker),
        );
        (router, breaker)
    }

    fn trip(breaker: &SharedCircuitBreaker, worker: &str) {
        let mut cb = breaker.lock().unwrap();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure(worker, now);
        }
        cb.maybe_open(worker, now);
    }

    fn workers(assignments: &[Assignment]) -> Vec<&str> {
        assignments.iter().map(|a| a.worker.as_str()).collect()
    }

    #[test]
    fn test_performance_routing_is_deterministic() {
        let (router, _) = router_with(RoutingPolicy::default());
        for _ in 0..5 {
            let assignments = router.route("optimize performance", Priority::Normal);
            assert_eq!(workers(&assignments), ["cheetah", "gpt-5-codex-high"]);
            assert_eq!(assignments[0].sub_task, "Performance: optimize performance");
        }
    }

    #[test]
    fn test_no_duplicates_across_tags_and_cap() {
        let (router, _) = router_with(RoutingPolicy::default());
        let assignments = router.route(
            "implement and design a quick review of the speed",
            Priority::High,
        );
        let names = workers(&assignments);
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
        assert_eq!(names.len(), MAX_ASSIGNMENTS);
        assert_eq!(
            names,
            ["gpt-5-codex-high", "grok-4-code", "claude-4.5", "gemini-2.5-pro"]
        );
        assert!(assignments.iter().all(|a| a.priority == Priority::High));
    }

    #[test]
    fn test_open_circuit_skipped() {
        let (router, breaker) = router_with(RoutingPolicy::default());
        trip(&breaker, "cheetah");
        let assignments = router.route("optimize it", Priority::Normal);
        assert_eq!(workers(&assignments), ["gpt-5-codex-high"]);
    }

    #[test]
    fn test_fallback_first_non_empty_table() {
        let mut policy = RoutingPolicy::default();
        policy.model_routing = HashMap::new();
        let (router, _) = router_with(policy);

        // No reasoning fallbacks in the default table, so analysis wins.
        let assignments = router.route("explain this", Priority::Normal);
        assert_eq!(workers(&assignments), ["gemini-2.5-pro"]);
        assert_eq!(assignments[0].sub_task, "Fallback Analysis: explain this");
    }

    #[test]
    fn test_alternative_worker_forced() {
        let policy = RoutingPolicy {
            model_routing: HashMap::new(),
            fallback_mapping: HashMap::new(),
            consensus_threshold: 0.7,
        };
        let (router, breaker) = router_with(policy);

        let assignments = router.route("anything", Priority::High);
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].worker, "gemini-2.5-flash");
        assert_eq!(assignments[0].priority, Priority::Low);
        assert_eq!(assignments[0].sub_task, "Alternative Analysis: anything");

        trip(&breaker, "gemini-2.5-flash");
        assert!(router.route("anything", Priority::High).is_empty());
    }

    struct FixedClassifier(Vec<CapabilityTag>);

    impl TagClassifier for FixedClassifier {
        fn classify(&self, _: &str) -> Vec<CapabilityTag> {
            self.0.clone()
        }
    }

    #[test]
    fn test_custom_classifier() {
        let (router, _) = router_with(RoutingPolicy::default());
        let router = router.with_classifier(FixedClassifier(vec![CapabilityTag::Context]));
        let assignments = router.route("whatever", Priority::Normal);
        assert_eq!(workers(&assignments), ["code-supernova-1-million", "claude-4.5"]);
        assert_eq!(assignments[0].sub_task, "Context: whatever");
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("analysis"), "Analysis");
        assert_eq!(capitalize(""), "");
    }
}
