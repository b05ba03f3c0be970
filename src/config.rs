//! Configuration for the flow pipeline
//!
//! Every field has a serde default, so a config file only needs the values
//! it changes. Files may reference environment variables as `${VAR}` or
//! `${VAR:default}`; placeholders are expanded before parsing.

use crate::error::{FlowError, Result};
use crate::logging::LoggingConfig;
use crate::model::OllamaConfig;
use crate::prompt::DEFAULT_SYSTEM_PROMPT;
use crate::retrieval::RetrievalConfig;
use crate::session::DEFAULT_AUTOSAVE_EVERY;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub task_control: TaskControlConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Admission and deadline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskControlConfig {
    /// Inputs processed at once; further inputs wait for a slot
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_retrieval_timeout_ms")]
    pub retrieval_timeout_ms: u64,
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_retrieval_timeout_ms() -> u64 {
    10_000
}

impl TaskControlConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }
}

impl Default for TaskControlConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            command_timeout_ms: default_command_timeout_ms(),
            retrieval_timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    /// Async dispatch workers; `min(32, cpus + 4)` when unset
    #[serde(default)]
    pub workers: Option<usize>,
}

/// Prompting and post-processing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Prior messages replayed as context
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,

    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    #[serde(default = "default_reasoning_start")]
    pub reasoning_start: String,

    #[serde(default = "default_reasoning_end")]
    pub reasoning_end: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_true")]
    pub stream: bool,

    #[serde(default)]
    pub ollama: OllamaConfig,
}

fn default_history_messages() -> usize {
    10
}

fn default_summary_max_chars() -> usize {
    200
}

fn default_reasoning_start() -> String {
    "<think>".to_string()
}

fn default_reasoning_end() -> String {
    "</think>".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            history_messages: default_history_messages(),
            summary_max_chars: default_summary_max_chars(),
            reasoning_start: default_reasoning_start(),
            reasoning_end: default_reasoning_end(),
            system_prompt: default_system_prompt(),
            stream: true,
            ollama: OllamaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory for per-session JSON files; in-memory only when unset
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    #[serde(default = "default_autosave_every")]
    pub autosave_every: usize,
}

fn default_autosave_every() -> usize {
    DEFAULT_AUTOSAVE_EVERY
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            autosave_every: default_autosave_every(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Regexes added to the built-in danger signatures
    #[serde(default)]
    pub extra_danger_patterns: Vec<String>,
}

impl FlowConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file and validate
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let config = match extension.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(FlowError::Config(format!(
                "Unsupported config format: {}",
                path.display()
            ))),
        }
        .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;

        tracing::info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse YAML after expanding environment placeholders
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env(content)?;
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| FlowError::Config(format!("Invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse JSON after expanding environment placeholders
    pub fn from_json_str(content: &str) -> Result<Self> {
        let expanded = expand_env(content)?;
        let config: Self = serde_json::from_str(&expanded)
            .map_err(|e| FlowError::Config(format!("Invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.task_control.max_concurrent_tasks == 0 {
            return Err(FlowError::Config(
                "task_control.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.task_control.command_timeout_ms == 0 || self.task_control.retrieval_timeout_ms == 0 {
            return Err(FlowError::Config("task_control timeouts must be positive".to_string()));
        }
        if self.retrieval.top_k == 0 {
            return Err(FlowError::Config("retrieval.top_k must be at least 1".to_string()));
        }
        if self.retrieval.search_kinds.is_empty() {
            return Err(FlowError::Config(
                "retrieval.search_kinds must name at least one kind".to_string(),
            ));
        }
        if self.retrieval.source_weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(FlowError::Config(
                "retrieval.source_weights must be non-negative".to_string(),
            ));
        }
        if self.model.reasoning_start.is_empty() || self.model.reasoning_end.is_empty() {
            return Err(FlowError::Config("model reasoning markers must not be empty".to_string()));
        }
        if self.bus.workers == Some(0) {
            return Err(FlowError::Config("bus.workers must be at least 1".to_string()));
        }
        for pattern in &self.gate.extra_danger_patterns {
            Regex::new(pattern).map_err(|e| {
                FlowError::Config(format!("gate.extra_danger_patterns '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }
}

/// Replace `${VAR}` and `${VAR:default}` with environment values
///
/// An unset variable without a default expands to an empty string.
pub fn expand_env(content: &str) -> Result<String> {
    let placeholder = Regex::new(r"\$\{([^}:]+)(?::([^}]*))?\}")
        .map_err(|e| FlowError::Config(format!("placeholder pattern: {}", e)))?;
    let expanded = placeholder.replace_all(content, |caps: &Captures| {
        let name = caps[1].trim();
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ => caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        }
    });
    Ok(expanded.into_owned())
}
