//! Configuration loading traits and types.
//!
//! Host modules and gateways are configured from TOML files. Every
//! deserializable type gets [`ConfigLoader::load`] through a blanket
//! implementation; the concrete configuration structs add semantic
//! validation on top.
//!
//! # Usage
//!
//! ```rust,no_run
//! use ocd_common::config::{ConfigError, ConfigLoader, GatewayConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = GatewayConfig::load(Path::new("gateway.toml"))?;
//!     config.validate()?;
//!     println!("Gateway for subnet {}", config.subnet);
//!     Ok(())
//! }
//! ```

use crate::addr::DIADDR_SUBNET_MAX;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default host controller endpoint.
pub const DEFAULT_HOST_CONTROLLER: &str = "tcp://127.0.0.1:9537";

/// Service name used when no `[shared]` table is configured.
pub const DEFAULT_SERVICE_NAME: &str = "ocd";

/// Default depth of the device-to-worker forwarding queue.
pub const DEFAULT_DEVICE_QUEUE_DEPTH: usize = 256;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Common configuration fields shared by every host-side component.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "systrace-logger"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timing bounds for the host-controller protocol.
///
/// All values are milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Bound for opening the TCP connection to the host controller.
    pub connect_ms: u64,
    /// Bound for a response to a register request or management command.
    pub response_ms: u64,
    /// Bound for the owner waiting on a worker status message.
    pub control_ms: u64,
    /// Bound for the device thread to observe cancellation.
    pub device_join_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 1000,
            response_ms: 1000,
            control_ms: 5000,
            device_join_ms: 2000,
        }
    }
}

impl Timeouts {
    /// Connect bound as a `Duration`.
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Response bound as a `Duration`.
    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }

    /// Control-channel bound as a `Duration`.
    pub fn control(&self) -> Duration {
        Duration::from_millis(self.control_ms)
    }

    /// Device join bound as a `Duration`.
    pub fn device_join(&self) -> Duration {
        Duration::from_millis(self.device_join_ms)
    }

    /// Validate that no bound is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("connect_ms", self.connect_ms),
            ("response_ms", self.response_ms),
            ("control_ms", self.control_ms),
            ("device_join_ms", self.device_join_ms),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ValidationError(format!(
                "timeouts.{name} must be greater than zero"
            )));
        }
        Ok(())
    }
}

/// Configuration of a host module.
///
/// # TOML Example
///
/// ```toml
/// host_controller = "tcp://127.0.0.1:9537"
///
/// [shared]
/// service_name = "systrace-logger"
///
/// [timeouts]
/// response_ms = 500
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostModConfig {
    /// Common settings; names the worker thread.
    #[serde(default)]
    pub shared: Option<SharedConfig>,

    /// Endpoint of the host controller.
    #[serde(default = "default_host_controller")]
    pub host_controller: String,

    /// Timing bounds.
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl HostModConfig {
    /// Create a configuration with default timeouts.
    pub fn new(host_controller: impl Into<String>) -> Self {
        Self {
            shared: None,
            host_controller: host_controller.into(),
            timeouts: Timeouts::default(),
        }
    }

    /// Service name from `[shared]`, or [`DEFAULT_SERVICE_NAME`].
    pub fn service_name(&self) -> &str {
        service_name(&self.shared)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_shared(&self.shared)?;
        validate_endpoint(&self.host_controller)?;
        self.timeouts.validate()
    }
}

impl Default for HostModConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_CONTROLLER)
    }
}

/// Configuration of a device gateway.
///
/// # TOML Example
///
/// ```toml
/// host_controller = "tcp://127.0.0.1:9537"
/// subnet = 1
/// device_queue_depth = 512
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Common settings; names the worker thread.
    #[serde(default)]
    pub shared: Option<SharedConfig>,

    /// Endpoint of the host controller.
    #[serde(default = "default_host_controller")]
    pub host_controller: String,

    /// Subnet address of the device behind this gateway.
    pub subnet: u16,

    /// Depth of the device-to-worker forwarding queue.
    #[serde(default = "default_device_queue_depth")]
    pub device_queue_depth: usize,

    /// Timing bounds.
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl GatewayConfig {
    /// Create a configuration with default queue depth and timeouts.
    pub fn new(host_controller: impl Into<String>, subnet: u16) -> Self {
        Self {
            shared: None,
            host_controller: host_controller.into(),
            subnet,
            device_queue_depth: DEFAULT_DEVICE_QUEUE_DEPTH,
            timeouts: Timeouts::default(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `host_controller` is empty
    /// - `subnet` exceeds the subnet address range
    /// - `device_queue_depth` is zero
    /// - any timeout is zero
    /// - a `[shared]` table has an empty `service_name`
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_shared(&self.shared)?;
        validate_endpoint(&self.host_controller)?;
        if self.subnet > DIADDR_SUBNET_MAX {
            return Err(ConfigError::ValidationError(format!(
                "subnet {} out of range (max {DIADDR_SUBNET_MAX})",
                self.subnet
            )));
        }
        if self.device_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "device_queue_depth must be greater than zero".to_string(),
            ));
        }
        self.timeouts.validate()
    }

    /// Service name from `[shared]`, or [`DEFAULT_SERVICE_NAME`].
    pub fn service_name(&self) -> &str {
        service_name(&self.shared)
    }
}

fn service_name(shared: &Option<SharedConfig>) -> &str {
    shared
        .as_ref()
        .map_or(DEFAULT_SERVICE_NAME, |s| s.service_name.as_str())
}

fn validate_shared(shared: &Option<SharedConfig>) -> Result<(), ConfigError> {
    shared.as_ref().map_or(Ok(()), SharedConfig::validate)
}

fn default_host_controller() -> String {
    DEFAULT_HOST_CONTROLLER.to_string()
}

fn default_device_queue_depth() -> usize {
    DEFAULT_DEVICE_QUEUE_DEPTH
}

fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    if endpoint.trim_start_matches("tcp://").is_empty() {
        return Err(ConfigError::ValidationError(
            "host_controller cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_level_into_tracing() {
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
        assert_eq!(tracing::Level::from(LogLevel::Warn), tracing::Level::WARN);
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_timeouts_default_and_durations() {
        let t = Timeouts::default();
        assert_eq!(t.response(), Duration::from_secs(1));
        assert_eq!(t.control(), Duration::from_secs(5));
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_timeouts_zero_rejected() {
        let t = Timeouts {
            response_ms: 0,
            ..Timeouts::default()
        };
        let err = t.validate().unwrap_err();
        assert!(err.to_string().contains("response_ms"));
    }

    #[test]
    fn test_gateway_subnet_range() {
        let mut config = GatewayConfig::new("tcp://localhost:9537", DIADDR_SUBNET_MAX);
        assert!(config.validate().is_ok());

        config.subnet = DIADDR_SUBNET_MAX + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let config = HostModConfig::new("tcp://");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = HostModConfig::load(Path::new("/nonexistent/path/hostmod.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = GatewayConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_hostmod_config_defaults_from_toml() {
        let config: HostModConfig = toml::from_str("").unwrap();
        assert_eq!(config.host_controller, DEFAULT_HOST_CONTROLLER);
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(config.service_name(), DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn test_empty_shared_service_name_rejected() {
        let mut config = GatewayConfig::new("tcp://localhost:9537", 1);
        config.shared = Some(SharedConfig {
            log_level: LogLevel::Warn,
            service_name: String::new(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
