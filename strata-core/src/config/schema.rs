//! Configuration schema definitions for Strata.
//!
//! All structures use serde for (de)serialization and `validator` for field
//! level checks. Cross-field rules live in [`super::validator`].

use crate::types::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Root configuration object.
///
/// Loaded in layers: defaults → TOML file → environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StrataConfig {
    /// Listener and connection settings
    #[validate(nested)]
    pub server: ServerConfig,

    /// Stream, consumer and KV engine settings
    #[validate(nested)]
    pub jetstream: JetStreamConfig,

    /// Log output settings
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Listener and per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the server to
    ///
    /// # Examples
    /// - `"0.0.0.0"` - bind to all interfaces
    /// - `"127.0.0.1"` - localhost only
    #[validate(ip)]
    pub host: String,

    /// Port number to listen on; 0 picks an ephemeral port
    pub port: u16,

    /// Name advertised in `INFO`
    #[validate(length(min = 1, max = 128))]
    pub server_name: String,

    /// Largest payload a client may publish
    #[validate(range(min = 1, max = 67_108_864))]
    pub max_payload: usize,

    /// Maximum number of concurrent connections
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_connections: usize,

    /// Frames buffered per connection before it is treated as a slow consumer
    #[validate(range(min = 16, max = 1_048_576))]
    pub outbound_capacity: usize,

    /// Runtime worker threads for the server binary; defaults to the CPU count
    pub worker_threads: Option<usize>,

    /// TCP keep-alive settings
    #[validate(nested)]
    pub keep_alive: KeepAliveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4222,
            server_name: "strata".to_string(),
            max_payload: 1024 * 1024,
            max_connections: 64 * 1024,
            outbound_capacity: 8192,
            worker_threads: None,
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Worker thread count, falling back to the number of CPUs.
    #[must_use]
    pub fn effective_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// TCP keep-alive configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Enable TCP keep-alive
    pub enabled: bool,

    /// Time before sending keep-alive probes (seconds)
    #[validate(range(min = 1, max = 7200))]
    pub idle_time: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self { enabled: true, idle_time: 60 }
    }
}

/// Stream/consumer/KV engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JetStreamConfig {
    /// Whether `$JS.API` and `$KV` requests are served
    pub enabled: bool,

    /// Administrative API subject prefix
    #[validate(length(min = 1))]
    pub api_prefix: String,

    /// Prefix of consumer acknowledgement subjects
    #[validate(length(min = 1))]
    pub ack_prefix: String,

    /// Key-value subject prefix
    #[validate(length(min = 1))]
    pub kv_prefix: String,

    /// Maximum number of streams; 0 is unlimited
    pub max_streams: usize,

    /// Maximum consumers per stream; 0 is unlimited
    pub max_consumers: usize,

    /// Bytes all stream stores may hold together; 0 is unlimited
    pub max_memory: usize,

    /// Largest batch a single pull request may ask for
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_batch: usize,

    /// How long a pull request without `expires` waits for messages
    #[serde(with = "duration_ms")]
    pub default_pull_wait: Duration,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_prefix: "$JS.API".to_string(),
            ack_prefix: "$JS.ACK".to_string(),
            kv_prefix: "$KV".to_string(),
            max_streams: 0,
            max_consumers: 0,
            max_memory: 0,
            max_batch: 1024,
            default_pull_wait: Duration::from_secs(30),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `strata_broker=debug,info`
    #[validate(length(min = 1))]
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Colourise text output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Text, ansi: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = StrataConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 4222);
        assert_eq!(config.jetstream.api_prefix, "$JS.API");
        assert_eq!(config.server.bind_address(), "0.0.0.0:4222");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: StrataConfig = toml::from_str(
            r#"
            [server]
            port = 5222

            [jetstream]
            default_pull_wait = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 5222);
        assert_eq!(config.server.server_name, "strata");
        assert_eq!(config.jetstream.default_pull_wait, Duration::from_millis(250));
        assert!(config.jetstream.enabled);
    }

    #[test]
    fn test_invalid_host_rejected() {
        let mut config = StrataConfig::default();
        config.server.host = "not-an-ip".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_threads_fallback() {
        let config = ServerConfig::default();
        assert!(config.effective_worker_threads() >= 1);
        let config = ServerConfig { worker_threads: Some(3), ..ServerConfig::default() };
        assert_eq!(config.effective_worker_threads(), 3);
    }

    #[test]
    fn test_log_format_serde() {
        let logging: LoggingConfig = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(logging.format, LogFormat::Json);
    }
}
