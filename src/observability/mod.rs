//! Logging setup
//!
//! Library code only emits `tracing` events; binaries and tests decide where
//! they go by calling [`init_logging`].

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparseable
pub const DEFAULT_FILTER: &str = "coalesce_stream=info";

/// Logging options loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives (default: `coalesce_stream=info`)
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: DEFAULT_FILTER.to_string(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Load from `RUST_LOG` and `COALESCE_LOG_JSON`
    pub fn from_env() -> Self {
        LogConfig {
            filter: std::env::var("RUST_LOG")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            json: std::env::var("COALESCE_LOG_JSON")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install a global `fmt` subscriber. Returns false if one was already set.
pub fn init_logging(config: &LogConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.filter, "coalesce_stream=info");
        assert!(!config.json);
    }

    #[test]
    fn test_filter_with_multiple_directives() {
        let config = LogConfig {
            filter: "warn,coalesce_stream::coalesce::writer=debug".to_string(),
            json: true,
        };
        let rendered = config.env_filter().to_string();
        assert!(rendered.contains("coalesce_stream::coalesce::writer"));
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::default();
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
