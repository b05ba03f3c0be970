//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events. Applications that embed the
//! pipeline call [`init_tracing`] once at startup (or install their own
//! subscriber).

use serde::{Deserialize, Serialize};

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit one JSON object per line instead of human-readable text
    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_true")]
    pub with_target: bool,
}

fn default_level() -> String {
    "a3s_flow=info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            with_target: true,
        }
    }
}

/// Filter from `RUST_LOG`, falling back to the configured directive, then
/// to `info`
fn make_filter(config: &LoggingConfig) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Install the global subscriber
///
/// Returns false when a subscriber was already installed; calling this
/// more than once is harmless.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(make_filter(config))
        .with_target(config.with_target);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::debug!(level = %config.level, json = config.json, "Tracing initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "a3s_flow=info");
        assert!(!config.json);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: LoggingConfig = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert!(config.json);
        assert_eq!(config.level, "a3s_flow=info");
        assert!(config.with_target);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
