//! Capability tag derivation from free-text task descriptions.
//!
//! Tags drive the routing table lookup. Each rule is a whole-word,
//! case-insensitive keyword match; a description can carry several tags and
//! they always come back in rule order.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Capability a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTag {
    Implementation,
    Architecture,
    Analysis,
    Creative,
    Fast,
    Reasoning,
    Performance,
    Context,
}

impl CapabilityTag {
    /// Every tag, in rule order.
    pub const ALL: [CapabilityTag; 8] = [
        CapabilityTag::Implementation,
        CapabilityTag::Architecture,
        CapabilityTag::Analysis,
        CapabilityTag::Creative,
        CapabilityTag::Fast,
        CapabilityTag::Reasoning,
        CapabilityTag::Performance,
        CapabilityTag::Context,
    ];

    /// Key used in routing tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implementation => "implementation",
            Self::Architecture => "architecture",
            Self::Analysis => "analysis",
            Self::Creative => "creative",
            Self::Fast => "fast",
            Self::Reasoning => "reasoning",
            Self::Performance => "performance",
            Self::Context => "context",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Implementation => &["implement", "code", "develop", "build"],
            Self::Architecture => &["architect", "design", "plan"],
            Self::Analysis => &["analysis", "analyze", "investigate", "review"],
            Self::Creative => &["creative", "brainstorm", "idea", "ideation"],
            Self::Fast => &["fast", "quick", "rapid"],
            Self::Reasoning => &["reason", "logic", "explain", "derive"],
            Self::Performance => &["optimize", "performance", "speed"],
            Self::Context => &["context", "memory", "integrate", "integration"],
        }
    }
}

impl std::fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives capability tags from a task description.
pub trait TagClassifier: Send + Sync {
    /// Tags for `description`, deduplicated, never empty.
    fn classify(&self, description: &str) -> Vec<CapabilityTag>;
}

static TAG_RULES: LazyLock<Vec<(CapabilityTag, Regex)>> = LazyLock::new(|| {
    CapabilityTag::ALL
        .iter()
        .map(|&tag| {
            let pattern = format!(r"(?i)\b(?:{})\b", tag.keywords().join("|"));
            let re = Regex::new(&pattern).expect("tag rule regex should compile");
            (tag, re)
        })
        .collect()
});

/// Whole-word keyword classifier. Falls back to [`CapabilityTag::Analysis`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl TagClassifier for KeywordClassifier {
    fn classify(&self, description: &str) -> Vec<CapabilityTag> {
        let tags: Vec<CapabilityTag> = TAG_RULES
            .iter()
            .filter(|(_, re)| re.is_match(description))
            .map(|(tag, _)| *tag)
            .collect();

        if tags.is_empty() {
            vec![CapabilityTag::Analysis]
        } else {
            tags
        }
    }
}
