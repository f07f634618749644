//! Secret redaction for audit log lines
//!
//! Walks a JSON value and replaces every string that looks like it carries
//! a credential, either by naming one or by containing a provider key.
//! Keys are kept; only string values are inspected.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Replacement for a redacted string value
pub const REDACTED: &str = "***REDACTED***";

/// Provider key names whose appearance anywhere in a string triggers redaction.
pub const SENSITIVE_KEY_NAMES: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "XAI_API_KEY",
    "OPENROUTER_API_KEY",
    "API_KEY",
    "TOKEN",
    "SECRET",
    "PASSWORD",
];

static KEY_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("(?i){}", SENSITIVE_KEY_NAMES.join("|")))
        .expect("KEY_NAME_RE regex should compile")
});

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)api[_-]?key|token|secret|password").expect("CREDENTIAL_RE regex should compile")
});

/// Bare provider keys (`sk-...`, `sk-ant-...`).
static KEY_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sk-[A-Za-z0-9_-]{16,}").expect("KEY_VALUE_RE regex should compile")
});

/// Whether a single string should be masked.
pub fn is_sensitive(value: &str) -> bool {
    !value.is_empty()
        && (KEY_NAME_RE.is_match(value)
            || CREDENTIAL_RE.is_match(value)
            || KEY_VALUE_RE.is_match(value))
}

/// Redact `value` in place, recursing through arrays and objects.
pub fn redact_in_place(value: &mut Value) {
    match value {
        Value::String(s) if is_sensitive(s) => *s = REDACTED.to_string(),
        Value::Array(items) => items.iter_mut().for_each(redact_in_place),
        Value::Object(map) => map.values_mut().for_each(redact_in_place),
        _ => {}
    }
}
