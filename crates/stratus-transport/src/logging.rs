//! Process-wide `tracing` subscriber setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;
use crate::error::{Result, TransportError};

/// Parses filter directives such as `info,stratus_transport=debug`.
pub fn parse_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives).map_err(|e| TransportError::Logging(e.to_string()))
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured filter. Fails if a global subscriber
/// is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => parse_filter(&directives)?,
        _ => parse_filter(&config.filter)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|e| TransportError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("info,stratus_transport=debug").is_ok());
        assert!(matches!(
            parse_filter("stratus_transport=loud"),
            Err(TransportError::Logging(_))
        ));
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig {
            filter: String::from("warn"),
            json: true,
        };
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
