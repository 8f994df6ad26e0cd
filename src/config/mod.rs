//! Configuration module
//!
//! Handles loading and saving Tandem configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::{SerializationFormat, DEFAULT_PORT, FORMAT_PRIORITY};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    /// Dispatcher settings
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Session context sync
    #[serde(default)]
    pub context: ContextConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this node
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Time allowed for the hello exchange in ms
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_handshake_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

/// RPC node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// How long a streaming call may wait for its first response (0 = forever)
    #[serde(default)]
    pub stream_start_timeout_ms: u64,
    /// How long finished references keep absorbing late frames
    #[serde(default = "default_grace_window")]
    pub grace_window_ms: u64,
    /// Violations tolerated before the connection is dropped (0 = no limit)
    #[serde(default = "default_max_violations")]
    pub max_protocol_violations: u32,
    /// Frames buffered ahead of the writer
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
    /// Unread items a single call may buffer before it is terminated
    #[serde(default = "default_call_buffer")]
    pub call_buffer: usize,
    /// Offered serialization formats, most preferred first
    #[serde(default = "default_formats")]
    pub formats: Vec<SerializationFormat>,
}

fn default_grace_window() -> u64 {
    10_000
}

fn default_max_violations() -> u32 {
    8
}

fn default_send_queue_depth() -> usize {
    256
}

fn default_call_buffer() -> usize {
    1024
}

fn default_formats() -> Vec<SerializationFormat> {
    FORMAT_PRIORITY.to_vec()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            stream_start_timeout_ms: 0,
            grace_window_ms: default_grace_window(),
            max_protocol_violations: default_max_violations(),
            send_queue_depth: default_send_queue_depth(),
            call_buffer: default_call_buffer(),
            formats: default_formats(),
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ping interval in ms
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
    /// Time to wait for a pong in ms
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_heartbeat_timeout() -> u64 {
    3000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tandem/config.toml")),
            Some(PathBuf::from("./tandem.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings a node cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.node.formats.is_empty() {
            return Err(ConfigError::Invalid("node.formats must list at least one format".into()));
        }
        if self.node.call_buffer == 0 {
            return Err(ConfigError::Invalid("node.call_buffer must be positive".into()));
        }
        if self.heartbeat.enabled && self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat.interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "build-agent-01".to_string(),
            verbose: false,
        },
        node: NodeSettings {
            stream_start_timeout_ms: 30_000,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.node.formats, FORMAT_PRIORITY.to_vec());
        assert!(config.heartbeat.enabled);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.node.max_protocol_violations = 3;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, config.network.port);
        assert_eq!(loaded.node.max_protocol_violations, 3);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nformats = [\"json\"]\n\n[heartbeat]\nenabled = false").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.node.formats, vec![SerializationFormat::Json]);
        assert_eq!(loaded.node.grace_window_ms, 10_000);
        assert_eq!(loaded.node.call_buffer, 1024);
        assert!(!loaded.heartbeat.enabled);
        assert_eq!(loaded.heartbeat.interval_ms, 1000);
    }

    #[test]
    fn test_empty_format_list_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nformats = []").unwrap();

        assert!(matches!(Config::load(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_call_buffer_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[node]\ncall_buffer = 0").unwrap();

        assert!(matches!(Config::load(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        let missing = Path::new("/definitely/not/here/tandem.toml");
        assert!(matches!(Config::load(missing), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "build-agent-01");
        assert_eq!(parsed.node.stream_start_timeout_ms, 30_000);
    }
}
