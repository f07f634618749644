//! Routing policy: which workers serve which capability tag.
//!
//! The policy is re-read on every routing decision so edits to the config
//! file take effect without a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::consensus::DEFAULT_CONSENSUS_THRESHOLD;

/// Tag → ordered worker lists plus the consensus threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPolicy {
    #[serde(default)]
    pub model_routing: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub fallback_mapping: HashMap<String, Vec<String>>,
    #[serde(default = "default_threshold")]
    pub consensus_threshold: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_CONSENSUS_THRESHOLD
}

fn table(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(tag, workers)| {
            (
                tag.to_string(),
                workers.iter().map(|w| w.to_string()).collect(),
            )
        })
        .collect()
}

impl Default for RoutingPolicy {
    /// Built-in table used when no readable policy file exists.
    fn default() -> Self {
        Self {
            model_routing: table(&[
                ("implementation", &["gpt-5-codex-high", "grok-4-code"]),
                ("architecture", &["claude-4.5", "gemini-2.5-pro"]),
                ("analysis", &["claude-4.5", "gemini-2.5-pro"]),
                ("creative", &["gemini-2.5-flash", "claude-4.5"]),
                ("fast", &["gemini-2.5-flash", "grok-code-fast-1"]),
                ("reasoning", &["claude-4.5", "gemini-2.5-pro"]),
                ("performance", &["cheetah", "gpt-5-codex-high"]),
                ("context", &["code-supernova-1-million", "claude-4.5"]),
            ]),
            fallback_mapping: table(&[
                ("implementation", &["gpt-5-codex-medium", "claude-4.5"]),
                ("architecture", &["claude-4.5"]),
                ("analysis", &["gemini-2.5-pro"]),
            ]),
            consensus_threshold: DEFAULT_CONSENSUS_THRESHOLD,
        }
    }
}

impl RoutingPolicy {
    pub fn workers_for(&self, tag: &str) -> &[String] {
        self.model_routing.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fallbacks_for(&self, tag: &str) -> &[String] {
        self.fallback_mapping
            .get(tag)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Parse the `orchestration` object of a settings document.
    ///
    /// A missing object yields empty tables. A present but mistyped table is
    /// an error. A threshold that is not a positive number becomes the default.
    pub fn from_settings(settings: &Value) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawOrchestration {
            #[serde(default)]
            model_routing: HashMap<String, Vec<String>>,
            #[serde(default)]
            fallback_mapping: HashMap<String, Vec<String>>,
            #[serde(default)]
            consensus_threshold: Value,
        }

        let orchestration = settings
            .get("orchestration")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let raw: RawOrchestration = serde_json::from_value(orchestration)?;

        let consensus_threshold = raw
            .consensus_threshold
            .as_f64()
            .filter(|t| t.is_finite() && *t > 0.0)
            .unwrap_or(DEFAULT_CONSENSUS_THRESHOLD);

        Ok(Self {
            model_routing: raw.model_routing,
            fallback_mapping: raw.fallback_mapping,
            consensus_threshold,
        })
    }
}

/// Where the router gets its policy from.
pub trait PolicySource: Send + Sync {
    fn load(&self) -> RoutingPolicy;
}

/// Fixed policy, mainly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicySource {
    policy: RoutingPolicy,
}

impl StaticPolicySource {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }
}

impl PolicySource for StaticPolicySource {
    fn load(&self) -> RoutingPolicy {
        self.policy.clone()
    }
}

/// Reads the policy from a JSON settings file on every call.
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PolicySource for FilePolicySource {
    fn load(&self) -> RoutingPolicy {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Policy file unreadable, using built-in routing");
                return RoutingPolicy::default();
            }
        };

        match serde_json::from_str::<Value>(&raw)
            .and_then(|settings| RoutingPolicy::from_settings(&settings))
        {
            Ok(policy) => policy,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Malformed policy file, using built-in routing");
                RoutingPolicy::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_table() {
        let policy = RoutingPolicy::default();
        assert_eq!(policy.workers_for("performance"), ["cheetah", "gpt-5-codex-high"]);
        assert_eq!(policy.fallbacks_for("analysis"), ["gemini-2.5-pro"]);
        assert!(policy.fallbacks_for("reasoning").is_empty());
        assert_eq!(policy.consensus_threshold, 0.7);
    }

    #[test]
    fn test_from_settings() {
        let settings = json!({
            "mcpServers": {},
            "orchestration": {
                "modelRouting": {"analysis": ["a", "b"]},
                "consensusThreshold": 0.8
            }
        });
        let policy = RoutingPolicy::from_settings(&settings).unwrap();
        assert_eq!(policy.workers_for("analysis"), ["a", "b"]);
        assert!(policy.fallback_mapping.is_empty());
        assert_eq!(policy.consensus_threshold, 0.8);
    }

    #[test]
    fn test_bad_threshold_falls_back() {
        for threshold in [json!("high"), json!(0), json!(-1.0), json!(null)] {
            let settings = json!({"orchestration": {"consensusThreshold": threshold}});
            let policy = RoutingPolicy::from_settings(&settings).unwrap();
            assert_eq!(policy.consensus_threshold, 0.7);
        }
    }

    #[test]
    fn test_missing_orchestration_is_empty() {
        let policy = RoutingPolicy::from_settings(&json!({"mcpServers": {}})).unwrap();
        assert!(policy.model_routing.is_empty());
        assert_eq!(policy.consensus_threshold, 0.7);
    }

    #[test]
    fn test_file_source_reads_fresh_each_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        let source = FilePolicySource::new(&path);

        assert_eq!(source.load(), RoutingPolicy::default());

        std::fs::write(
            &path,
            r#"{"orchestration": {"modelRouting": {"fast": ["x"]}}}"#,
        )
        .unwrap();
        assert_eq!(source.load().workers_for("fast"), ["x"]);

        std::fs::write(&path, "{ broken").unwrap();
        assert_eq!(source.load(), RoutingPolicy::default());

        std::fs::write(
            &path,
            r#"{"orchestration": {"modelRouting": {"fast": "x"}}}"#,
        )
        .unwrap();
        assert_eq!(source.load(), RoutingPolicy::default());
    }
}
