//! Configuration module for arcproxy
//!
//! JSON configuration, one section per component. Every field has a default
//! so an empty object `{}` is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Listener and session settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Request queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Primary upstream node and sub-request limits
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Inventory/routing snapshot settings
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Local SDS archive
    #[serde(default)]
    pub local: LocalConfig,

    /// File the request container is saved to on shutdown and restored from on startup
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_executing == 0 {
            return Err(Error::Config("queue.max_executing must be at least 1".into()));
        }
        if self.upstream.max_lines_per_request == 0 {
            return Err(Error::Config(
                "upstream.max_lines_per_request must be at least 1".into(),
            ));
        }
        crate::common::Address::parse(&self.server.listen)?;
        crate::common::Address::parse(&self.upstream.address)?;
        Ok(())
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Organization name sent in reply to HELLO
    pub organization: String,
    /// Datacenter id shown on synthetic volumes
    pub dcid: String,
    pub max_sessions: usize,
    /// Idle timeout for client sessions and I/O timeout towards upstream nodes
    pub socket_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:18001".to_string(),
            organization: "proxy".to_string(),
            dcid: "GFZ".to_string(),
            max_sessions: 500,
            socket_timeout: 300,
        }
    }
}

impl ServerConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queued: usize,
    /// 0 disables the per-user limit
    pub max_queued_per_user: usize,
    pub max_executing: usize,
    /// Maximum number of lines in one client request
    pub max_lines: usize,
    /// Age in seconds after which a finished request is purged
    pub max_age: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queued: 500,
            max_queued_per_user: 10,
            max_executing: 10,
            max_lines: 5000,
            max_age: 860000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Primary node, used for direct submission when routing is off
    pub address: String,
    /// User name for sub-requests when the client did not send USER
    pub default_user: String,
    /// Seconds to wait for a remote request to become ready, per retry
    pub request_timeout: u64,
    pub download_retries: u32,
    pub max_lines_per_request: usize,
    pub max_megabytes_per_request: u64,
    /// Address rewrites applied to routing destinations
    pub aliases: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "webdc.eu:18001".to_string(),
            default_user: "guest@anywhere".to_string(),
            request_timeout: 300,
            download_retries: 5,
            max_lines_per_request: 990,
            max_megabytes_per_request: 500,
            aliases: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Send everything to the primary node instead of routing
    pub disabled: bool,
    /// Expand wildcards against the inventory before routing
    pub use_inventory: bool,
    /// Inventory snapshot (JSON)
    pub inventory_file: Option<PathBuf>,
    /// Routing snapshot (JSON)
    pub routing_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// SDS root directories, searched in order
    pub directories: Vec<PathBuf>,
    /// Serve waveform requests from the local archive only
    pub local_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:18001");
        assert_eq!(config.server.organization, "proxy");
        assert_eq!(config.queue.max_queued_per_user, 10);
        assert_eq!(config.upstream.max_lines_per_request, 990);
        assert_eq!(config.upstream.address, "webdc.eu:18001");
        assert!(!config.routing.disabled);
        assert!(config.state_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_section() {
        let config = Config::from_json(
            r#"{"queue": {"max_executing": 2}, "local": {"local_only": true}}"#,
        )
        .unwrap();
        assert_eq!(config.queue.max_executing, 2);
        assert_eq!(config.queue.max_queued, 500);
        assert!(config.local.local_only);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config
            .upstream
            .aliases
            .insert("a:18001".into(), "b:18001".into());
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.upstream.aliases.get("a:18001").unwrap(), "b:18001");
    }

    #[test]
    fn test_validate_rejects_zero_executing() {
        let config = Config::from_json(r#"{"queue": {"max_executing": 0}}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
