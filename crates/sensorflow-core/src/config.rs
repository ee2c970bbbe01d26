/*!
 * Configuration management for SensorFlow.
 *
 * Settings are layered: built-in defaults, then an optional TOML file, then
 * environment variables (`SENSORFLOW__SECTION__KEY`), then explicit overrides
 * supplied by the caller (usually the command line).
 */
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::millis_to_duration;

/// Environment variable prefix used by [`ConfigBuilder::with_default_environment`]
pub const ENV_PREFIX: &str = "SENSORFLOW";

/// Serial number / hub port value meaning "any device"
pub const ANY: i32 = -1;

/// Core configuration for SensorFlow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Device server connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Client backend name (simulated, tcp)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Server host
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Channel addressing and tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel index on the device
    #[serde(default)]
    pub index: u32,

    /// Device serial number, `-1` for any
    #[serde(default = "default_any")]
    pub serial_number: i32,

    /// Hub port, `-1` for any
    #[serde(default = "default_any")]
    pub hub_port: i32,

    /// Label used when logging readings
    #[serde(default = "default_label")]
    pub label: String,

    /// Open timeout in milliseconds
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Sampling period in milliseconds
    #[serde(default = "default_data_interval_ms")]
    pub data_interval_ms: u64,

    /// Minimum absolute change that produces a change event
    #[serde(default)]
    pub change_trigger: f64,
}

/// Session lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long the session listens for change events, in milliseconds
    #[serde(default = "default_listen_duration_ms")]
    pub listen_duration_ms: u64,

    /// Capacity of the change event queue
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Close and release the connection when opening the channel fails
    #[serde(default = "default_true")]
    pub release_on_open_failure: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            index: 0,
            serial_number: ANY,
            hub_port: ANY,
            label: default_label(),
            open_timeout_ms: default_open_timeout_ms(),
            data_interval_ms: default_data_interval_ms(),
            change_trigger: 0.0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_duration_ms: default_listen_duration_ms(),
            event_buffer: default_event_buffer(),
            release_on_open_failure: true,
        }
    }
}

impl ServerConfig {
    /// Connection timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        millis_to_duration(self.connect_timeout_ms)
    }
}

impl ChannelConfig {
    /// Open timeout as a duration
    pub fn open_timeout(&self) -> Duration {
        millis_to_duration(self.open_timeout_ms)
    }

    /// Sampling period as a duration
    pub fn data_interval(&self) -> Duration {
        millis_to_duration(self.data_interval_ms)
    }
}

impl SessionConfig {
    /// Listening duration
    pub fn listen_duration(&self) -> Duration {
        millis_to_duration(self.listen_duration_ms)
    }
}

impl Config {
    /// Check values that deserialize fine but make no sense at runtime
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(Error::config("server.host must not be empty"));
        }
        if self.server.port == 0 {
            return Err(Error::config("server.port must be non-zero"));
        }
        if self.server.connect_timeout_ms == 0 {
            return Err(Error::config("server.connect_timeout_ms must be non-zero"));
        }
        if self.channel.open_timeout_ms == 0 {
            return Err(Error::config("channel.open_timeout_ms must be non-zero"));
        }
        if self.channel.data_interval_ms == 0 {
            return Err(Error::config("channel.data_interval_ms must be non-zero"));
        }
        if !self.channel.change_trigger.is_finite() || self.channel.change_trigger < 0.0 {
            return Err(Error::config(
                "channel.change_trigger must be a finite, non-negative number",
            ));
        }
        if self.channel.serial_number < ANY || self.channel.hub_port < ANY {
            return Err(Error::config(
                "channel.serial_number and channel.hub_port must be -1 or a valid value",
            ));
        }
        if self.session.event_buffer == 0 {
            return Err(Error::config("session.event_buffer must be at least 1"));
        }
        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_app_name() -> String {
    "sensorflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backend() -> String {
    "simulated".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5661
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_any() -> i32 {
    ANY
}

fn default_label() -> String {
    "VoltageRatio".to_string()
}

fn default_open_timeout_ms() -> u64 {
    5000
}

fn default_data_interval_ms() -> u64 {
    250
}

fn default_listen_duration_ms() -> u64 {
    5000
}

fn default_event_buffer() -> usize {
    64
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    require_file: bool,
    environment_prefix: Option<String>,
    overrides: Vec<(String, String)>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path. A missing file falls back to defaults.
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the config file path and fail the build if it does not exist
    pub fn with_required_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.require_file = true;
        self.with_config_file(path)
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Read environment variables with the `SENSORFLOW` prefix
    pub fn with_default_environment(self) -> Self {
        self.with_environment_prefix(ENV_PREFIX)
    }

    /// Override a single dotted key, e.g. `server.port`
    pub fn set_override<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.overrides.push((key.into(), value.to_string()));
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else if self.require_file {
                return Err(Error::config(format!(
                    "Configuration file {} does not exist",
                    config_file
                )));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        for (key, value) in self.overrides {
            config_builder = config_builder
                .set_override(key.as_str(), value)
                .map_err(|e| Error::config(format!("Invalid override {}: {}", key, e)))?;
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}
