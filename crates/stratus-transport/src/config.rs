//! Transport configuration surface.
//!
//! Every numeric threshold is non-negative and `0` disables the dimension it
//! governs, except where a field says otherwise.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TransportError};

fn millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

/// Keep-alive thresholds for a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Close the connection after this long without inbound frames.
    pub idle_timeout_millis: u64,
    /// Send a PING after this long without inbound frames.
    pub ping_interval_millis: u64,
    /// How long a PING may stay unacknowledged. `0` means `ping_interval_millis`.
    pub ping_timeout_millis: u64,
    /// Recycle the connection once it is this old.
    pub max_connection_age_millis: u64,
    /// Recycle the connection after this many streams.
    pub max_num_requests_per_connection: u64,
    /// Whether an inbound PING counts as activity for the idle timer.
    pub keep_alive_on_ping: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            idle_timeout_millis: 10_000,
            ping_interval_millis: 0,
            ping_timeout_millis: 0,
            max_connection_age_millis: 0,
            max_num_requests_per_connection: 0,
            keep_alive_on_ping: false,
        }
    }
}

impl KeepAliveConfig {
    /// A configuration with every dimension disabled.
    pub fn disabled() -> Self {
        Self {
            idle_timeout_millis: 0,
            ..Self::default()
        }
    }

    /// Returns the idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        millis(self.idle_timeout_millis)
    }

    /// Returns the ping interval, if enabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        millis(self.ping_interval_millis)
    }

    /// Returns the tolerance for an unacknowledged ping, if pings are enabled.
    pub fn ping_timeout(&self) -> Option<Duration> {
        self.ping_interval()?;
        millis(self.ping_timeout_millis).or_else(|| self.ping_interval())
    }

    /// Returns the maximum connection age, if enabled.
    pub fn max_connection_age(&self) -> Option<Duration> {
        millis(self.max_connection_age_millis)
    }

    /// Returns the per-connection request limit, if enabled.
    pub fn max_requests(&self) -> Option<u64> {
        (self.max_num_requests_per_connection > 0).then_some(self.max_num_requests_per_connection)
    }

    /// Returns true if at least one dimension is enabled.
    pub fn is_enabled(&self) -> bool {
        self.idle_timeout().is_some()
            || self.ping_interval().is_some()
            || self.max_connection_age().is_some()
            || self.max_requests().is_some()
    }
}

/// Graceful drain settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Time between the shutdown announcement and the final GOAWAY. `0` finalizes immediately.
    pub drain_duration_micros: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            drain_duration_micros: 1_000_000,
        }
    }
}

impl DrainConfig {
    /// Returns the drain duration.
    pub fn drain_duration(&self) -> Duration {
        Duration::from_micros(self.drain_duration_micros)
    }
}

/// Inbound backpressure water marks, in unread bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Suspend reads once this many bytes are buffered. `0` disables the gate.
    pub high_water_mark: u64,
    /// Resume reads once buffered bytes fall to this level.
    pub low_water_mark: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 128 * 1024,
            low_water_mark: 64 * 1024,
        }
    }
}

/// Request decoding limits applied when a service does not override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Maximum request body length in bytes. `0` means unlimited.
    pub max_request_length: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_request_length: 10 * 1024 * 1024,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: String::from("info"),
            json: false,
        }
    }
}

/// Root configuration for the transport core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Keep-alive thresholds.
    pub keep_alive: KeepAliveConfig,
    /// Graceful drain settings.
    pub drain: DrainConfig,
    /// Inbound backpressure water marks.
    pub traffic: TrafficConfig,
    /// Default request limits.
    pub request: RequestConfig,
    /// Log output.
    pub log: LogConfig,
}

impl TransportConfig {
    /// Loads a configuration from a `.toml` or `.json` file and validates it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TransportConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(TransportError::InvalidConfig {
                    reason: format!("unsupported config file extension: {ext}"),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let traffic = &self.traffic;
        if traffic.high_water_mark > 0 && traffic.low_water_mark > traffic.high_water_mark {
            return Err(TransportError::InvalidConfig {
                reason: format!(
                    "low_water_mark ({}) exceeds high_water_mark ({})",
                    traffic.low_water_mark, traffic.high_water_mark
                ),
            });
        }
        let keep_alive = &self.keep_alive;
        if keep_alive.ping_timeout_millis > 0 && keep_alive.ping_interval_millis == 0 {
            return Err(TransportError::InvalidConfig {
                reason: String::from("ping_timeout_millis requires ping_interval_millis"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = TransportConfig::default();
        assert_eq!(config.keep_alive.idle_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.keep_alive.ping_interval(), None);
        assert_eq!(config.keep_alive.ping_timeout(), None);
        assert_eq!(config.drain.drain_duration(), Duration::from_secs(1));
        assert_eq!(config.request.max_request_length, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disabled_keep_alive() {
        let config = KeepAliveConfig::disabled();
        assert!(!config.is_enabled());
        assert_eq!(config.max_requests(), None);
    }

    #[test]
    fn test_ping_timeout_defaults_to_interval() {
        let config = KeepAliveConfig {
            ping_interval_millis: 3_000,
            ..KeepAliveConfig::disabled()
        };
        assert_eq!(config.ping_timeout(), Some(Duration::from_secs(3)));

        let config = KeepAliveConfig {
            ping_interval_millis: 3_000,
            ping_timeout_millis: 500,
            ..KeepAliveConfig::disabled()
        };
        assert_eq!(config.ping_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_validate_rejects_inverted_water_marks() {
        let mut config = TransportConfig::default();
        config.traffic.low_water_mark = config.traffic.high_water_mark + 1;
        assert!(matches!(
            config.validate(),
            Err(TransportError::InvalidConfig { .. })
        ));

        config.traffic.high_water_mark = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_orphan_ping_timeout() {
        let mut config = TransportConfig::default();
        config.keep_alive.ping_timeout_millis = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[keep_alive]
idle_timeout_millis = 5000
max_num_requests_per_connection = 100

[drain]
drain_duration_micros = 2000
"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.keep_alive.idle_timeout_millis, 5000);
        assert_eq!(config.keep_alive.max_requests(), Some(100));
        assert_eq!(config.drain.drain_duration_micros, 2000);
        assert_eq!(config.traffic, TrafficConfig::default());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"request": {{"max_request_length": 1024}}, "log": {{"json": true}}}}"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.request.max_request_length, 1024);
        assert!(config.log.json);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            TransportConfig::from_file(file.path()),
            Err(TransportError::InvalidConfig { .. })
        ));
    }
}
