//! Configuration loading for clipsync-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! section and field is optional; missing values take the defaults below.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for clipsync-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay listener configuration.
    pub server: ServerConfig,
    /// Rate limiting and framing limits.
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    pub http: HttpConfig,
    /// Cleanup task configuration.
    pub cleanup: CleanupConfig,
}

/// Relay listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the device-facing TCP listener (default: 0.0.0.0:7070).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Sustained frames per device per minute (default: 100).
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,
    /// Frames a device may send back-to-back before the sustained rate applies (default: 10).
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// New connections per source IP per minute (default: 30).
    #[serde(default = "default_connections_per_minute")]
    pub connections_per_minute: u32,
    /// Seconds a new connection has to send `register` (default: 10).
    #[serde(default = "default_hello_timeout_secs")]
    pub hello_timeout_secs: u64,
    /// Largest frame payload accepted, in bytes (default: 1 MiB).
    ///
    /// A larger frame closes the connection.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Frames per second across all devices (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 300).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_messages_per_minute() -> u32 {
    100
}

fn default_burst() -> u32 {
    10
}

fn default_connections_per_minute() -> u32 {
    30
}

fn default_hello_timeout_secs() -> u64 {
    10
}

fn default_max_frame_len() -> usize {
    clipsync_types::DEFAULT_MAX_FRAME_LEN
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: default_messages_per_minute(),
            burst: default_burst(),
            connections_per_minute: default_connections_per_minute(),
            hello_timeout_secs: default_hello_timeout_secs(),
            max_frame_len: default_max_frame_len(),
            global_requests_per_second: default_global_requests_per_second(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// [`Config::validate`].
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        let nonzero = [
            ("limits.messages_per_minute", limits.messages_per_minute),
            ("limits.burst", limits.burst),
            ("limits.connections_per_minute", limits.connections_per_minute),
            (
                "limits.global_requests_per_second",
                limits.global_requests_per_second,
            ),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if limits.max_frame_len == 0 || limits.max_frame_len > u32::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "limits.max_frame_len",
                reason: format!("must be between 1 and {}", u32::MAX),
            });
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cleanup.interval_secs",
                reason: "must be greater than zero when cleanup is enabled".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
