//! Append-only JSONL audit log
//!
//! Every line is `{"ts", "level", "event", ...context}`. Lines are redacted
//! before they are written, appends and rotation are serialized through one
//! mutex, and failures are reported through `tracing` rather than returned
//! to the pipeline.

pub mod redact;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{PersistError, PersistResult};
use crate::state::files::{file_len, rotate_file};
use crate::state::RotationPolicy;

pub use redact::{redact_in_place, REDACTED};

/// File name of the audit log inside the log directory
pub const LOG_FILE_NAME: &str = "orchestrator.jsonl";

/// Severity of an audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub path: PathBuf,
    /// When false nothing is written
    pub enabled: bool,
    pub redact: bool,
    pub rotation: RotationPolicy,
}

impl AuditConfig {
    pub fn in_dir(log_dir: impl AsRef<Path>) -> Self {
        Self {
            path: log_dir.as_ref().join(LOG_FILE_NAME),
            enabled: true,
            redact: true,
            rotation: RotationPolicy::LOG,
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    lines_since_rotation: usize,
}

/// Shared reference to an AuditLog
pub type SharedAuditLog = Arc<AuditLog>;

/// JSONL audit log with redaction and rotation.
#[derive(Debug)]
pub struct AuditLog {
    config: AuditConfig,
    state: Mutex<WriterState>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WriterState::default()),
        }
    }

    /// A log that drops every line.
    pub fn disabled() -> Self {
        Self::new(AuditConfig {
            path: PathBuf::new(),
            enabled: false,
            redact: true,
            rotation: RotationPolicy::LOG,
        })
    }

    pub fn shared(self) -> SharedAuditLog {
        Arc::new(self)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Create an empty log file if none exists.
    pub fn ensure_file(&self) -> PersistResult<()> {
        if !self.config.enabled || self.config.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
        }
        std::fs::File::create(&self.config.path)
            .map(|_| ())
            .map_err(|e| PersistError::io(&self.config.path, e))
    }

    /// Build the line for `event` without writing it.
    pub fn format_line(&self, level: Level, event: &str, context: Value) -> Value {
        let mut line = Map::new();
        line.insert(
            "ts".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        line.insert("level".into(), Value::String(level.as_str().into()));
        line.insert("event".into(), Value::String(event.into()));

        match context {
            Value::Object(fields) => {
                for (key, value) in fields {
                    if !matches!(key.as_str(), "ts" | "level" | "event") {
                        line.insert(key, value);
                    }
                }
            }
            Value::Null => {}
            other => {
                line.insert("context".into(), other);
            }
        }

        let mut line = Value::Object(line);
        if self.config.redact {
            redact_in_place(&mut line);
        }
        line
    }

    /// Append one line, rotating first when the file is over the size limit
    /// and after every `max_entries` lines.
    pub fn record(&self, level: Level, event: &str, context: Value) -> PersistResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let line = self.format_line(level, event, context);
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');

        let path = &self.config.path;
        let rotation = self.config.rotation;
        let mut state = self.state.lock().map_err(|_| PersistError::LockPoisoned)?;

        if file_len(path) >= rotation.max_bytes {
            self.rotate(&mut state)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| PersistError::io(path, e))?;
        file.write_all(&encoded)
            .map_err(|e| PersistError::io(path, e))?;

        state.lines_since_rotation += 1;
        if state.lines_since_rotation >= rotation.max_entries {
            self.rotate(&mut state)?;
        }

        Ok(())
    }

    fn rotate(&self, state: &mut WriterState) -> PersistResult<()> {
        rotate_file(&self.config.path, self.config.rotation.keep)?;
        std::fs::File::create(&self.config.path)
            .map_err(|e| PersistError::io(&self.config.path, e))?;
        state.lines_since_rotation = 0;
        Ok(())
    }

    /// Best-effort [`record`](Self::record): failures become a `tracing` warning.
    pub fn log(&self, level: Level, event: &str, context: Value) {
        if let Err(e) = self.record(level, event, context) {
            warn!(event, error = %e, "Failed to write audit line");
        }
    }

    pub fn info(&self, event: &str, context: Value) {
        self.log(Level::Info, event, context);
    }

    pub fn warn(&self, event: &str, context: Value) {
        self.log(Level::Warn, event, context);
    }

    pub fn error(&self, event: &str, context: Value) {
        self.log(Level::Error, event, context);
    }
}
