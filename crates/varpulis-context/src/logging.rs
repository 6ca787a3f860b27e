//! Tracing subscriber setup for processes embedding a nested context.

use crate::config::LoggingConfig;
use crate::error::{ContextError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(config: &LoggingConfig) -> String {
    format!("varpulis_context={}", config.level)
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level; `format` selects `json` or plain `text` output on
/// stderr.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(config).into());
    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        "text" => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        other => {
            return Err(ContextError::Logging(format!(
                "unknown log format '{}', expected text or json",
                other
            )))
        }
    };
    result.map_err(|e| ContextError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        let config = LoggingConfig {
            level: "debug".into(),
            format: "text".into(),
        };
        assert_eq!(default_directive(&config), "varpulis_context=debug");
    }

    #[test]
    fn test_unknown_format_rejected() {
        let config = LoggingConfig {
            level: "info".into(),
            format: "xml".into(),
        };
        assert!(matches!(init_tracing(&config), Err(ContextError::Logging(_))));
    }
}
