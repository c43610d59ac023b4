//! Configuration schema definitions.
//!
//! This module defines the structure of the configuration file using serde.
//! All configuration sections are defined here with appropriate defaults.

use super::error::{ConfigError, ConfigResult};
use crate::device::PortConfiguration;
use crate::transport::WriteBufferLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial port configuration
    pub serial: SerialConfig,
    /// Transport tuning
    pub transport: TransportConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Check values that deserialize fine but cannot be used.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.serial.default_baud == 0 {
            return Err(ConfigError::validation("serial.default_baud", "must be non-zero"));
        }
        self.transport.validate()
    }
}

/// Serial port configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Default baud rate for new connections
    pub default_baud: u32,
    /// Timeout for opening a device, in milliseconds
    pub open_timeout_ms: u64,
    /// Port aliases for convenience
    #[serde(default)]
    pub port_aliases: HashMap<String, String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud: 115200,
            open_timeout_ms: 1000,
            port_aliases: HashMap::new(),
        }
    }
}

impl SerialConfig {
    /// Get the open timeout as Duration
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Resolve a port name through aliases
    pub fn resolve_port(&self, name: &str) -> String {
        self.port_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Port settings for opening a device at `baud_rate` (or the default).
    pub fn port_configuration(&self, baud_rate: Option<u32>) -> PortConfiguration {
        PortConfiguration {
            baud_rate: baud_rate.unwrap_or(self.default_baud),
            timeout: self.open_timeout(),
            ..PortConfiguration::default()
        }
    }
}

/// Transport tuning section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum bytes pulled from the device per readable event
    pub read_chunk_size: usize,
    /// High-water mark; derived from `low_water` when unset
    pub high_water: Option<usize>,
    /// Low-water mark; derived from `high_water` when unset
    pub low_water: Option<usize>,
    /// Poll interval in microseconds, used where readiness events are unavailable
    pub poll_interval_us: u64,
    /// Polling writes only happen while the driver queues fewer bytes than this
    pub max_out_waiting: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 1024,
            high_water: None,
            low_water: None,
            poll_interval_us: 500,
            max_out_waiting: 1024,
        }
    }
}

impl TransportConfig {
    /// Get the poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.read_chunk_size == 0 {
            return Err(ConfigError::validation("transport.read_chunk_size", "must be non-zero"));
        }
        if self.poll_interval_us == 0 {
            return Err(ConfigError::validation("transport.poll_interval_us", "must be non-zero"));
        }
        WriteBufferLimits::new(self.high_water, self.low_water)
            .map_err(|e| ConfigError::validation("transport.high_water", e.to_string()))?;
        Ok(())
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive: "trace", "debug", "info", "warn", "error" or an
    /// `EnvFilter` expression
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.serial.default_baud, 115200);
        assert_eq!(config.transport.read_chunk_size, 1024);
        assert_eq!(config.transport.poll_interval(), Duration::from_micros(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_alias_resolution() {
        let mut config = SerialConfig::default();
        config
            .port_aliases
            .insert("arduino".to_string(), "/dev/ttyACM0".to_string());

        assert_eq!(config.resolve_port("arduino"), "/dev/ttyACM0");
        assert_eq!(config.resolve_port("/dev/ttyUSB1"), "/dev/ttyUSB1");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[serial]"));
        assert!(toml_str.contains("[transport]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [serial]
            default_baud = 9600

            [transport]
            high_water = 4096
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.serial.default_baud, 9600);
        assert_eq!(config.transport.high_water, Some(4096));
        // Defaults should still work
        assert_eq!(config.transport.max_out_waiting, 1024);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.transport.high_water = Some(10);
        config.transport.low_water = Some(20);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { .. })
        ));

        let mut config = Config::default();
        config.transport.read_chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.poll_interval_us = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_configuration_uses_default_baud() {
        let config = SerialConfig::default();
        assert_eq!(config.port_configuration(None).baud_rate, 115200);
        assert_eq!(config.port_configuration(Some(9600)).baud_rate, 9600);
    }
}
