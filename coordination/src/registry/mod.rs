//! Worker identity and capability metadata
//!
//! Populated once at startup and read-only afterwards. The executor copies a
//! [`WorkerMetadata`] snapshot into every result so consensus can weight
//! responses without going back to the registry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Reliability assumed when a snapshot carries none.
pub const DEFAULT_RELIABILITY: f64 = 0.9;

/// Freshness half-life (minutes) assumed when a snapshot carries none.
pub const DEFAULT_HALF_LIFE_MIN: f64 = 120.0;

/// Tier assigned to workers that are routed to but never registered.
pub const UNREGISTERED_TIER: u8 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Worker already registered: {0}")]
    Duplicate(String),

    #[error("Invalid worker {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// A registered worker. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProfile {
    pub name: String,
    /// Priority class, lower is preferred on ties.
    pub tier: u8,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    /// Capacity hint in tokens. Informational only.
    pub context_window: u32,
    /// Prior success probability in (0, 1].
    pub reliability: f64,
    pub freshness_half_life_min: f64,
}

impl WorkerProfile {
    pub fn new(name: impl Into<String>, tier: u8) -> Self {
        Self {
            name: name.into(),
            tier,
            strengths: Vec::new(),
            weaknesses: Vec::new(),
            context_window: 0,
            reliability: DEFAULT_RELIABILITY,
            freshness_half_life_min: DEFAULT_HALF_LIFE_MIN,
        }
    }

    pub fn with_strengths(mut self, tags: &[&str]) -> Self {
        self.strengths = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_weaknesses(mut self, tags: &[&str]) -> Self {
        self.weaknesses = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_half_life(mut self, minutes: f64) -> Self {
        self.freshness_half_life_min = minutes;
        self
    }

    pub fn has_strength(&self, tag: &str) -> bool {
        self.strengths.iter().any(|s| s == tag)
    }

    /// Snapshot copied into each [`crate::state::WorkerResult`].
    pub fn snapshot(&self) -> WorkerMetadata {
        WorkerMetadata {
            tier: Some(self.tier),
            strengths: self.strengths.clone(),
            weaknesses: self.weaknesses.clone(),
            context_window: Some(self.context_window),
            reliability: Some(self.reliability),
            freshness_half_life_min: Some(self.freshness_half_life_min),
        }
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must be non-empty"));
        }
        if !(self.reliability > 0.0 && self.reliability <= 1.0) {
            return Err(invalid("reliability must be in (0, 1]"));
        }
        if !(self.freshness_half_life_min > 0.0) {
            return Err(invalid("freshness half-life must be positive"));
        }
        Ok(())
    }
}

/// Worker metadata as carried by a result.
///
/// Fields are optional because results may be read back from disk or come
/// from workers that were routed by policy without being registered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strengths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weaknesses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness_half_life_min: Option<f64>,
}

impl WorkerMetadata {
    /// Snapshot used for workers the registry does not know.
    pub fn unregistered() -> Self {
        Self {
            tier: Some(UNREGISTERED_TIER),
            reliability: Some(DEFAULT_RELIABILITY),
            freshness_half_life_min: Some(DEFAULT_HALF_LIFE_MIN),
            ..Default::default()
        }
    }

    /// Reliability, or [`DEFAULT_RELIABILITY`] when absent or non-positive.
    pub fn reliability_or_default(&self) -> f64 {
        match self.reliability {
            Some(r) if r > 0.0 => r,
            _ => DEFAULT_RELIABILITY,
        }
    }

    /// Half-life in minutes, or [`DEFAULT_HALF_LIFE_MIN`] when absent or non-positive.
    pub fn half_life_or_default(&self) -> f64 {
        match self.freshness_half_life_min {
            Some(h) if h > 0.0 => h,
            _ => DEFAULT_HALF_LIFE_MIN,
        }
    }
}

/// Lookup table of workers keyed by name.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    entries: HashMap<String, WorkerProfile>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in worker table.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for profile in builtin_workers() {
            // Built-in names are unique and valid.
            let _ = registry.register(profile);
        }
        registry
    }

    /// Add a worker. Names are unique; re-registering is an error.
    pub fn register(&mut self, profile: WorkerProfile) -> Result<(), RegistryError> {
        profile.validate()?;
        if self.entries.contains_key(&profile.name) {
            return Err(RegistryError::Duplicate(profile.name));
        }
        self.entries.insert(profile.name.clone(), profile);
        Ok(())
    }

    /// Look up a worker by name. Pure read.
    pub fn get(&self, name: &str) -> Option<&WorkerProfile> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Metadata snapshot for `name`, falling back to the unregistered default.
    pub fn snapshot(&self, name: &str) -> WorkerMetadata {
        self.get(name)
            .map(WorkerProfile::snapshot)
            .unwrap_or_else(WorkerMetadata::unregistered)
    }

    /// Registered names, ordered by tier then name.
    pub fn names(&self) -> Vec<&str> {
        let mut entries: Vec<&WorkerProfile> = self.entries.values().collect();
        entries.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));
        entries.into_iter().map(|p| p.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The built-in worker table.
pub fn builtin_workers() -> Vec<WorkerProfile> {
    vec![
        WorkerProfile::new("claude-4.5", 1)
            .with_strengths(&[
                "complex-reasoning",
                "architecture",
                "orchestration",
                "code-analysis",
            ])
            .with_weaknesses(&["speed", "creative-ideation"])
            .with_context_window(200_000)
            .with_reliability(0.97)
            .with_half_life(120.0),
        WorkerProfile::new("gpt-5-codex-high", 2)
            .with_strengths(&[
                "code-generation",
                "implementation",
                "refactoring",
                "testing",
            ])
            .with_weaknesses(&["architectural-reasoning", "creative-problem-solving"])
            .with_context_window(128_000)
            .with_reliability(0.95)
            .with_half_life(120.0),
        WorkerProfile::new("cheetah", 3)
            .with_strengths(&[
                "performance-optimization",
                "speed",
                "efficiency",
                "real-time-analysis",
            ])
            .with_weaknesses(&["complex-reasoning", "creative-tasks"])
            .with_context_window(32_000)
            .with_reliability(0.90)
            .with_half_life(60.0),
        WorkerProfile::new("code-supernova-1-million", 4)
            .with_strengths(&["project-context", "continuity", "memory", "integration"])
            .with_weaknesses(&["raw-power", "speed"])
            .with_context_window(1_000_000)
            .with_reliability(0.92)
            .with_half_life(240.0),
        WorkerProfile::new("gemini-2.5-flash", 5)
            .with_strengths(&[
                "rapid-prototyping",
                "iteration",
                "quick-analysis",
                "creativity",
            ])
            .with_weaknesses(&["deep-reasoning", "complex-architecture"])
            .with_context_window(32_000)
            .with_reliability(0.93)
            .with_half_life(90.0),
    ]
}
