//! Orchestrator configuration
//!
//! Layered in increasing precedence: built-in defaults, an optional TOML
//! file, then environment variables. An environment value that does not
//! parse leaves the previous layer's value in place.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::PersistError;
use crate::resilience::{BackoffPolicy, CircuitPolicy, RetryPolicy};
use crate::state::RotationPolicy;

/// Coordination subdirectories created at startup.
pub const COORDINATION_SUBDIRS: [&str; 4] = ["sessions", "tasks", "decisions", "communication"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Project root not found at {0}. Set PROJECT_ROOT to a valid directory.")]
    ProjectRootMissing(PathBuf),

    #[error("Directory init/permission failed for {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create baseline file: {0}")]
    Baseline(#[from] PersistError),
}

/// Runtime settings for the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub project_root: PathBuf,
    /// Defaults to `<project_root>/AI_COORDINATION`
    pub coordination_dir: Option<PathBuf>,
    /// Defaults to `<project_root>/tools_config_files/enhanced_mcp_settings.json`
    pub mcp_config_path: Option<PathBuf>,
    /// Defaults to `<coordination_dir>/logs`
    pub log_dir: Option<PathBuf>,

    pub max_concurrency: usize,
    pub task_timeout_ms: u64,
    pub model_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_max_ms: u64,
    pub circuit_fails: usize,
    pub circuit_window_ms: u64,
    pub circuit_cooldown_ms: u64,

    pub log_jsonl: bool,
    pub log_redact: bool,
    pub log_max_bytes: u64,
    pub log_max_lines: usize,
    pub log_keep: usize,

    pub state_max_bytes: u64,
    pub state_max_tasks: usize,
    pub state_keep: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            coordination_dir: None,
            mcp_config_path: None,
            log_dir: None,
            max_concurrency: 4,
            task_timeout_ms: 300_000,
            model_timeout_ms: 30_000,
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_factor: 2.0,
            backoff_max_ms: 15_000,
            circuit_fails: 3,
            circuit_window_ms: 120_000,
            circuit_cooldown_ms: 300_000,
            log_jsonl: true,
            log_redact: true,
            log_max_bytes: RotationPolicy::LOG.max_bytes,
            log_max_lines: RotationPolicy::LOG.max_entries,
            log_keep: RotationPolicy::LOG.keep,
            state_max_bytes: RotationPolicy::STATE.max_bytes,
            state_max_tasks: RotationPolicy::STATE.max_entries,
            state_keep: RotationPolicy::STATE.keep,
        }
    }
}

fn set_parsed<T: std::str::FromStr>(target: &mut T, raw: Option<String>) {
    if let Some(value) = raw.and_then(|v| v.trim().parse().ok()) {
        *target = value;
    }
}

impl OrchestratorConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup("PROJECT_ROOT") {
            self.project_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("AI_COORDINATION_DIR") {
            self.coordination_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup("MCP_CONFIG_PATH") {
            self.mcp_config_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("AI_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }

        set_parsed(&mut self.max_concurrency, lookup("AI_MAX_CONCURRENCY"));
        set_parsed(&mut self.task_timeout_ms, lookup("AI_TASK_TIMEOUT_MS"));
        set_parsed(&mut self.model_timeout_ms, lookup("AI_MODEL_TIMEOUT_MS"));
        set_parsed(&mut self.max_retries, lookup("AI_MAX_RETRIES"));
        set_parsed(&mut self.backoff_base_ms, lookup("AI_BACKOFF_BASE_MS"));
        set_parsed(&mut self.backoff_max_ms, lookup("AI_BACKOFF_MAX_MS"));
        set_parsed(&mut self.circuit_fails, lookup("AI_CIRCUIT_FAILS"));
        set_parsed(&mut self.circuit_window_ms, lookup("AI_CIRCUIT_WINDOW_MS"));
        set_parsed(&mut self.circuit_cooldown_ms, lookup("AI_CIRCUIT_COOLDOWN_MS"));

        let mut factor = self.backoff_factor;
        set_parsed(&mut factor, lookup("AI_BACKOFF_FACTOR"));
        if factor.is_finite() {
            self.backoff_factor = factor;
        }

        // Only "1" enables, as with the shell-style flags these mirror.
        if let Some(flag) = lookup("AI_LOG_JSONL") {
            self.log_jsonl = flag.trim() == "1";
        }
        if let Some(flag) = lookup("AI_LOG_REDACT") {
            self.log_redact = flag.trim() == "1";
        }
    }

    pub fn coordination_dir(&self) -> PathBuf {
        self.coordination_dir
            .clone()
            .unwrap_or_else(|| self.project_root.join("AI_COORDINATION"))
    }

    pub fn mcp_config_path(&self) -> PathBuf {
        self.mcp_config_path.clone().unwrap_or_else(|| {
            self.project_root
                .join("tools_config_files")
                .join("enhanced_mcp_settings.json")
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.coordination_dir().join("logs"))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            attempt_timeout: Duration::from_millis(self.model_timeout_ms),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                factor: self.backoff_factor,
                max: Duration::from_millis(self.backoff_max_ms),
                jitter: true,
            },
        }
    }

    pub fn circuit_policy(&self) -> CircuitPolicy {
        CircuitPolicy {
            failure_threshold: self.circuit_fails,
            window: Duration::from_millis(self.circuit_window_ms),
            cooldown: Duration::from_millis(self.circuit_cooldown_ms),
        }
    }

    pub fn log_rotation(&self) -> RotationPolicy {
        RotationPolicy {
            max_bytes: self.log_max_bytes,
            max_entries: self.log_max_lines,
            keep: self.log_keep,
        }
    }

    pub fn state_rotation(&self) -> RotationPolicy {
        RotationPolicy {
            max_bytes: self.state_max_bytes,
            max_entries: self.state_max_tasks,
            keep: self.state_keep,
        }
    }

    /// Every directory the orchestrator writes to.
    pub fn directories(&self) -> Vec<PathBuf> {
        let coordination = self.coordination_dir();
        let mut dirs = vec![coordination.clone()];
        dirs.extend(COORDINATION_SUBDIRS.iter().map(|d| coordination.join(d)));
        dirs.push(self.log_dir());
        dirs
    }

    /// Create every directory and prove it is writable with a temp file.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        if !self.project_root.is_dir() {
            return Err(ConfigError::ProjectRootMissing(self.project_root.clone()));
        }

        for dir in self.directories() {
            let fail = |source| ConfigError::Directory {
                path: dir.clone(),
                source,
            };
            std::fs::create_dir_all(&dir).map_err(fail)?;
            let probe = dir.join(format!(
                ".permcheck_{}_{:08x}.tmp",
                chrono::Utc::now().timestamp_millis(),
                rand::random::<u32>()
            ));
            std::fs::write(&probe, b"ok").map_err(fail)?;
            std::fs::remove_file(&probe).map_err(fail)?;
            debug!(dir = %dir.display(), "Directory ready");
        }
        Ok(())
    }
}
