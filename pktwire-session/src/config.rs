//! Session and server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PKTWIRE_CONFIG or --config)
//! 3. Environment variables

use crate::session::{DEFAULT_INBOX_LIMIT, DEFAULT_OUTBOUND_LIMIT, DEFAULT_PENDING_PING_LIMIT};
use crate::versions::BUILTIN_PROTOCOLS;
use pktwire_protocol::MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "PKTWIRE_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Protocol selection and limits.
    pub protocol: ProtocolConfig,
    /// Per-session limits.
    pub session: SessionConfig,
    /// Listener configuration.
    pub network: NetworkConfig,
    /// Logging configuration.
    pub log: LogConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.protocol.apply_overrides(&lookup);
        self.session.apply_overrides(&lookup);
        self.network.apply_overrides(&lookup);
        self.log.apply_overrides(&lookup);
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol.validate()?;
        self.session.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Protocol used when none is requested explicitly.
    pub default: String,
    /// Protocol ids registered at startup.
    pub enabled: Vec<String>,
    /// Largest payload a frame may carry, in bytes.
    pub max_payload_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            default: "framed".to_string(),
            enabled: BUILTIN_PROTOCOLS.iter().map(|id| id.to_string()).collect(),
            max_payload_bytes: MAX_PAYLOAD_SIZE,
        }
    }
}

impl ProtocolConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("PKTWIRE_PROTOCOL") {
            self.default = id;
        }

        if let Some(list) = lookup("PKTWIRE_PROTOCOLS") {
            self.enabled = list
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(max) = lookup("PKTWIRE_MAX_PAYLOAD") {
            if let Ok(n) = max.parse() {
                self.max_payload_bytes = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled.is_empty() {
            return Err(ConfigError::ValidationError(
                "no protocols enabled".to_string(),
            ));
        }
        if let Some(unknown) = self
            .enabled
            .iter()
            .find(|id| !BUILTIN_PROTOCOLS.contains(&id.as_str()))
        {
            return Err(ConfigError::ValidationError(format!(
                "unknown protocol '{}' (expected one of: {})",
                unknown,
                BUILTIN_PROTOCOLS.join(", ")
            )));
        }
        if !self.enabled.contains(&self.default) {
            return Err(ConfigError::ValidationError(format!(
                "default protocol '{}' is not enabled",
                self.default
            )));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_payload_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum replies queued on a session before further replies fail.
    pub outbound_queue_limit: usize,
    /// Chat lines kept per session; the oldest is dropped when full.
    pub inbox_limit: usize,
    /// Unanswered pings tracked per session; the oldest is forgotten when full.
    pub pending_ping_limit: usize,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_limit: DEFAULT_OUTBOUND_LIMIT,
            inbox_limit: DEFAULT_INBOX_LIMIT,
            pending_ping_limit: DEFAULT_PENDING_PING_LIMIT,
            idle_timeout_secs: 300,
        }
    }
}

impl SessionConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(limit) = lookup("PKTWIRE_OUTBOUND_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.outbound_queue_limit = n;
            }
        }

        if let Some(limit) = lookup("PKTWIRE_INBOX_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.inbox_limit = n;
            }
        }

        if let Some(limit) = lookup("PKTWIRE_PENDING_PINGS") {
            if let Ok(n) = limit.parse() {
                self.pending_ping_limit = n;
            }
        }

        if let Some(timeout) = lookup("PKTWIRE_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue_limit == 0 {
            return Err(ConfigError::ValidationError(
                "outbound_queue_limit must be greater than zero".to_string(),
            ));
        }
        if self.inbox_limit == 0 {
            return Err(ConfigError::ValidationError(
                "inbox_limit must be greater than zero".to_string(),
            ));
        }
        if self.pending_ping_limit == 0 {
            return Err(ConfigError::ValidationError(
                "pending_ping_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7420)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("PKTWIRE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Some(max) = lookup("PKTWIRE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when RUST_LOG is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("PKTWIRE_LOG") {
            self.level = level;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde helpers for SocketAddr as a string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.protocol.default, "framed");
        assert_eq!(config.protocol.enabled.len(), BUILTIN_PROTOCOLS.len());
        assert_eq!(config.protocol.max_payload_bytes, MAX_PAYLOAD_SIZE);
        assert_eq!(config.network.bind_addr.port(), 7420);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("PKTWIRE_PROTOCOL", "classic"),
            ("PKTWIRE_PROTOCOLS", "classic, compact"),
            ("PKTWIRE_MAX_PAYLOAD", "4096"),
            ("PKTWIRE_OUTBOUND_LIMIT", "16"),
            ("PKTWIRE_INBOX_LIMIT", "8"),
            ("PKTWIRE_PENDING_PINGS", "2"),
            ("PKTWIRE_BIND", "0.0.0.0:9000"),
            ("PKTWIRE_LOG", "debug"),
        ]));

        assert_eq!(config.protocol.default, "classic");
        assert_eq!(config.protocol.enabled, vec!["classic", "compact"]);
        assert_eq!(config.protocol.max_payload_bytes, 4096);
        assert_eq!(config.session.outbound_queue_limit, 16);
        assert_eq!(config.session.inbox_limit, 8);
        assert_eq!(config.session.pending_ping_limit, 2);
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.log.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[("PKTWIRE_MAX_PAYLOAD", "lots")]));
        assert_eq!(config.protocol.max_payload_bytes, MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.protocol.default = "classic".to_string();
        config.protocol.enabled = vec!["framed".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not enabled"));

        let mut config = Config::default();
        config.protocol.enabled.push("v9".to_string());
        assert!(config.validate().unwrap_err().to_string().contains("v9"));

        let mut config = Config::default();
        config.session.outbound_queue_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.inbox_limit = 0;
        assert!(config.validate().unwrap_err().to_string().contains("inbox_limit"));

        let mut config = Config::default();
        config.session.pending_ping_limit = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("pending_ping_limit"));
    }

    #[test]
    fn test_yaml_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "protocol:\n  default: compact\n  enabled: [compact]\nsession:\n  outbound_queue_limit: 4\n",
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.protocol.default, "compact");
        assert_eq!(config.session.outbound_queue_limit, 4);
        // Unspecified sections keep their defaults.
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/pktwire.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let file = NamedTempFile::new().unwrap();
        let config = Config::default();
        config.save(file.path()).unwrap();

        let parsed = Config::from_file(file.path()).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.protocol.enabled, config.protocol.enabled);
    }
}
