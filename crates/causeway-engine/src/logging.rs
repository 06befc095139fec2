//! Structured logging setup.
//!
//! The library crates only emit `tracing` events; hosts decide where they go.
//! [`init_logging`] installs a `tracing-subscriber` formatter filtered by
//! `RUST_LOG` when set, otherwise by [`LoggingConfig`]. Cause stack
//! corruption is reported at `error`, so the default `warn` level keeps it
//! visible.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::EngineError;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level: trace, debug, info, warn, error, off.
    #[serde(default = "default_level")]
    pub level: String,

    /// Per-target overrides, e.g. `causeway_stack::manager = "trace"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,

    /// Include the event target in each line.
    #[serde(default = "default_true")]
    pub with_target: bool,
}

fn default_level() -> String {
    "warn".to_owned()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            modules: HashMap::new(),
            with_target: true,
        }
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed, so calling
/// this more than once (e.g. from several tests) is harmless.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<bool, EngineError> {
    let filter = build_env_filter(config)?;
    let with_target = config.map_or(true, |c| c.with_target);
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(with_target)
        .try_init()
        .is_ok();
    Ok(installed)
}

/// `RUST_LOG` when set, otherwise the configured level and overrides.
pub fn build_env_filter(config: Option<&LoggingConfig>) -> Result<EnvFilter, EngineError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let defaults = LoggingConfig::default();
    let config = config.unwrap_or(&defaults);

    config
        .level
        .parse::<LevelFilter>()
        .map_err(|e| EngineError::LogDirective {
            directive: config.level.clone(),
            details: format!("{e}"),
        })?;
    let mut filter = EnvFilter::new(&config.level);
    for (module, level) in &config.modules {
        let directive = format!("{module}={level}");
        let parsed = directive.parse().map_err(|e| EngineError::LogDirective {
            directive: directive.clone(),
            details: format!("{e}"),
        })?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_is_warn() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "warn");
        assert!(config.with_target);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"modules": {"causeway_stack": "trace"}}"#).unwrap();
        assert_eq!(config.level, "warn");
        assert_eq!(config.modules["causeway_stack"], "trace");
    }

    #[test]
    fn bad_directive_is_reported() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let mut config = LoggingConfig::default();
        config
            .modules
            .insert("causeway_stack".to_owned(), "not a level".to_owned());
        let err = build_env_filter(Some(&config)).unwrap_err();
        assert!(matches!(err, EngineError::LogDirective { .. }));
    }

    #[test]
    fn bad_base_level_is_reported() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "loud".to_owned(),
            ..Default::default()
        };
        let err = build_env_filter(Some(&config)).unwrap_err();
        assert!(matches!(err, EngineError::LogDirective { ref directive, .. } if directive == "loud"));

        let config = LoggingConfig {
            level: "DEBUG".to_owned(),
            ..Default::default()
        };
        assert!(build_env_filter(Some(&config)).is_ok());
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(None).unwrap();
        assert!(!init_logging(None).unwrap());
    }
}
