//! Configuration management for ClipMesh
//!
//! Loads, validates and writes the TOML configuration of a node.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the config file location
pub const CONFIG_ENV_VAR: &str = "CLIPMESH_CONFIG";

/// Default endpoint port
pub const DEFAULT_PORT: u16 = 50051;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Registry key of this node
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Endpoint bind address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// IP other nodes should dial; detected when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_ip: Option<String>,

    /// Seed nodes (`host:port`) to register with at startup
    #[serde(default)]
    pub peers: Vec<String>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Sync manager and endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Updates that may queue for one stream subscriber
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Consecutive failed deliveries before a node is evicted (0 = never)
    #[serde(default)]
    pub peer_failure_limit: u32,

    /// Seconds between re-registrations with known nodes (0 = disabled)
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,

    /// Largest accepted snapshot payload in bytes
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,

    /// Per-request timeout for outbound calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn announce_interval(&self) -> Option<Duration> {
        (self.announce_interval_secs > 0).then(|| Duration::from_secs(self.announce_interval_secs))
    }
}

/// Clipboard backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardBackend {
    /// The OS clipboard
    #[default]
    Native,
    /// In-process clipboard, for headless nodes and tests
    Memory,
}

/// Change monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub backend: ClipboardBackend,

    /// Interval for the polling monitor
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long `stop` waits for the listener thread
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

fn default_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_subscriber_buffer() -> usize {
    32
}

fn default_announce_interval() -> u64 {
    60
}

fn default_max_payload_size() -> usize {
    crate::MAX_PAYLOAD_SIZE
}

fn default_request_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    500
}

fn default_stop_timeout() -> u64 {
    2000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            peer_failure_limit: 0,
            announce_interval_secs: default_announce_interval(),
            max_payload_size: default_max_payload_size(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            backend: ClipboardBackend::default(),
            poll_interval_ms: default_poll_interval(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            listen_addr: default_listen_addr(),
            advertise_ip: None,
            peers: Vec::new(),
            log_level: default_log_level(),
            sync: SyncConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from CLIPMESH_CONFIG environment variable
    /// 2. ~/.config/clipmesh/config.toml
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration with an optional explicit path
    pub fn load_config(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_from_path(&path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate_config()?;
        Ok(config)
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("clipmesh").join("config.toml"))
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        Self::default_path().filter(|p| p.exists())
    }

    /// Port part of the listen address
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_addr.parse::<SocketAddr>().ok().map(|addr| addr.port())
    }

    /// Validate configuration values
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::Validation("hostname must not be empty".to_string()));
        }

        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "listen_addr '{}' is not a valid socket address",
                self.listen_addr
            )));
        }

        if let Some(ip) = &self.advertise_ip {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "advertise_ip '{}' is not a valid IP address",
                    ip
                )));
            }
        }

        if let Some(peer) = self.peers.iter().find(|p| !p.contains(':')) {
            return Err(ConfigError::Validation(format!(
                "peer '{}' must be in host:port form",
                peer
            )));
        }

        if self.sync.subscriber_buffer == 0 {
            return Err(ConfigError::Validation(
                "sync.subscriber_buffer must be at least 1".to_string(),
            ));
        }

        // Upper bound keeps a base64 encoded snapshot inside one WebSocket frame.
        if !(1024..=crate::MAX_PAYLOAD_SIZE).contains(&self.sync.max_payload_size) {
            return Err(ConfigError::Validation(format!(
                "sync.max_payload_size must be between 1024 and {} bytes",
                crate::MAX_PAYLOAD_SIZE
            )));
        }

        if self.sync.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "sync.request_timeout_secs must be at least 1".to_string(),
            ));
        }

        if !(50..=60_000).contains(&self.monitor.poll_interval_ms) {
            return Err(ConfigError::Validation(
                "monitor.poll_interval_ms must be between 50 and 60000".to_string(),
            ));
        }

        Ok(())
    }

    /// Write configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Write a commented example configuration to `path`
    pub fn write_example(path: &Path, force: bool) -> Result<(), ConfigError> {
        if !force && path.exists() {
            return Err(ConfigError::Validation(
                "Config file already exists. Use --force to overwrite.".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::generate_example())?;
        Ok(())
    }

    /// Generate example configuration file
    pub fn generate_example() -> String {
        let config = Config::default();

        format!(
            r#"# ClipMesh Configuration File
# Location: ~/.config/clipmesh/config.toml

# Name this node registers under; must be unique in the mesh
hostname = "{}"

# Endpoint bind address
listen_addr = "{}"

# IP other nodes dial to reach this one (detected when unset)
# advertise_ip = "192.168.1.10"

# Nodes to register with at startup
peers = []

# Logging level (trace, debug, info, warn, error)
log_level = "{}"

[sync]
# Updates queued per stream subscriber before it is dropped
subscriber_buffer = {}
# Failed deliveries before a node is evicted (0 = never)
peer_failure_limit = {}
# Seconds between re-registrations with known nodes (0 = disabled)
announce_interval_secs = {}
# Largest accepted snapshot payload in bytes
max_payload_size = {}
# Timeout for outbound requests in seconds
request_timeout_secs = {}

[monitor]
# Clipboard backend ("native" or "memory")
backend = "native"
# Polling interval where no change notification is available
poll_interval_ms = {}
# How long shutdown waits for the monitor thread
stop_timeout_ms = {}
"#,
            config.hostname,
            config.listen_addr,
            config.log_level,
            config.sync.subscriber_buffer,
            config.sync.peer_failure_limit,
            config.sync.announce_interval_secs,
            config.sync.max_payload_size,
            config.sync.request_timeout_secs,
            config.monitor.poll_interval_ms,
            config.monitor.stop_timeout_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "0.0.0.0:50051");
        assert_eq!(config.listen_port(), Some(50051));
        assert_eq!(config.sync.subscriber_buffer, 32);
        assert_eq!(config.sync.peer_failure_limit, 0);
        assert_eq!(config.monitor.backend, ClipboardBackend::Native);
        assert!(!config.hostname.is_empty());
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = Config::from_toml(
            r#"
            hostname = "desk"
            peers = ["10.0.0.2:50051"]

            [sync]
            peer_failure_limit = 3

            [monitor]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.hostname, "desk");
        assert_eq!(config.peers, vec!["10.0.0.2:50051".to_string()]);
        assert_eq!(config.sync.peer_failure_limit, 3);
        assert_eq!(config.sync.announce_interval_secs, 60);
        assert_eq!(config.monitor.backend, ClipboardBackend::Memory);
        assert_eq!(config.monitor.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            r#"hostname = """#,
            r#"listen_addr = "not-an-address""#,
            r#"advertise_ip = "nowhere""#,
            r#"peers = ["missing-port"]"#,
            "[sync]\nsubscriber_buffer = 0",
            "[sync]\nmax_payload_size = 10",
            "[sync]\nrequest_timeout_secs = 0",
            "[monitor]\npoll_interval_ms = 1",
        ];
        for case in cases {
            assert!(
                matches!(Config::from_toml(case), Err(ConfigError::Validation(_))),
                "expected validation error for {:?}",
                case
            );
        }
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = Config::from_toml("[monitor]\nbackend = \"x11\"");
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_announce_interval_disabled() {
        let mut config = SyncConfig::default();
        assert_eq!(config.announce_interval(), Some(Duration::from_secs(60)));
        config.announce_interval_secs = 0;
        assert_eq!(config.announce_interval(), None);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.hostname = "laptop".to_string();
        config.advertise_ip = Some("192.168.1.20".to_string());
        config.peers = vec!["192.168.1.10:50051".to_string()];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_example_parses() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        Config::write_example(&path, false).unwrap();
        let parsed = Config::load_from_path(&path).unwrap();
        assert_eq!(parsed.sync, SyncConfig::default());

        assert!(Config::write_example(&path, false).is_err());
        assert!(Config::write_example(&path, true).is_ok());
    }
}
