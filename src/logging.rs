//! Logging setup shared by both binaries

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Filter directive to use: the command line wins over the config file
pub fn effective_level<'a>(config: &'a LoggingConfig, cli_level: Option<&'a str>) -> &'a str {
    cli_level
        .filter(|level| !level.is_empty())
        .unwrap_or(config.level.as_str())
}

/// Build the filter, preferring `RUST_LOG` when it is set
pub fn build_filter(level: &str) -> Result<EnvFilter, crate::Error> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(level)
        .map_err(|e| crate::Error::Config(format!("Invalid log level '{}': {}", level, e)))
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig, cli_level: Option<&str>) -> Result<(), crate::Error> {
    let filter = build_filter(effective_level(config, cli_level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    result.map_err(|e| crate::Error::Config(format!("Failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_level_overrides_config() {
        let config = LoggingConfig::default();
        assert_eq!(effective_level(&config, None), "info");
        assert_eq!(effective_level(&config, Some("debug")), "debug");
        assert_eq!(effective_level(&config, Some("")), "info");
    }

    #[test]
    fn test_filter_directives() {
        assert!(EnvFilter::try_new("bridge_tunnel=trace,warn").is_ok());
        assert!(EnvFilter::try_new("info").is_ok());
    }
}
