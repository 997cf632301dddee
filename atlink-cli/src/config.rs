//! Configuration file support for atlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ATLINK_*)
//! 3. Local config file (./atlink.toml)
//! 4. Global config file (~/.config/atlink/config.toml)

use atlink::{SessionConfig, TransportConfig};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "atlink.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB2" or "COM5").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Session tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Receive buffer size in bytes.
    pub ring_capacity: Option<usize>,
    /// Write budget for each AT command in milliseconds.
    pub command_timeout_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Session configuration.
    #[serde(default)]
    pub session: SessionSettings,
    /// Default script variables; `--set` wins.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "atlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.connection.serial.is_some() {
            self.port.connection.serial = other.port.connection.serial;
        }
        if other.port.connection.baud.is_some() {
            self.port.connection.baud = other.port.connection.baud;
        }

        if other.session.ring_capacity.is_some() {
            self.session.ring_capacity = other.session.ring_capacity;
        }
        if other.session.command_timeout_ms.is_some() {
            self.session.command_timeout_ms = other.session.command_timeout_ms;
        }

        self.vars.extend(other.vars);
    }

    /// Transport settings with configured overrides applied.
    pub fn transport_config(&self) -> TransportConfig {
        let mut transport = TransportConfig::default();
        match self.session.ring_capacity {
            Some(0) => warn!("Ignoring ring_capacity = 0"),
            Some(capacity) => transport.capacity = capacity,
            None => {},
        }
        transport
    }

    /// Session settings with configured overrides applied.
    pub fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig::default();
        if let Some(ms) = self.session.command_timeout_ms {
            session.command_timeout = Duration::from_millis(ms);
        }
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_none());
        assert!(config.port.connection.baud.is_none());
        assert!(config.session.ring_capacity.is_none());
        assert!(config.vars.is_empty());
    }

    #[test]
    fn test_default_overrides_match_library() {
        let config = Config::default();
        assert_eq!(config.transport_config().capacity, TransportConfig::default().capacity);
        assert_eq!(
            config.session_config().command_timeout,
            SessionConfig::default().command_timeout
        );
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_serial_and_baud() {
        let mut base = Config::default();
        base.port.connection.baud = Some(115200);

        let mut other = Config::default();
        other.port.connection.serial = Some("/dev/ttyUSB2".to_string());
        other.port.connection.baud = Some(921600);

        base.merge(other);

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyUSB2"));
        assert_eq!(base.port.connection.baud, Some(921600));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.port.connection.serial = Some("/dev/ttyUSB2".to_string());
        base.session.command_timeout_ms = Some(5000);

        base.merge(Config::default());

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyUSB2"));
        assert_eq!(base.session.command_timeout_ms, Some(5000));
    }

    #[test]
    fn test_config_merge_vars_later_wins() {
        let mut base = Config::default();
        base.vars.insert("url".to_string(), "http://global".to_string());
        base.vars.insert("file".to_string(), "fw.bin".to_string());

        let mut other = Config::default();
        other.vars.insert("url".to_string(), "http://local".to_string());

        base.merge(other);
        assert_eq!(base.vars["url"], "http://local");
        assert_eq!(base.vars["file"], "fw.bin");
    }

    // ---- TOML ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port.connection]
serial = "/dev/ttyUSB2"
baud = 921600

[session]
ring_capacity = 16384
command_timeout_ms = 3000

[vars]
url = "http://example.com/fw.bin"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyUSB2"));
        assert_eq!(config.port.connection.baud, Some(921600));
        assert_eq!(config.transport_config().capacity, 16384);
        assert_eq!(config.session_config().command_timeout, Duration::from_secs(3));
        assert_eq!(config.vars["url"], "http://example.com/fw.bin");
    }

    #[test]
    fn test_zero_ring_capacity_is_ignored() {
        let mut config = Config::default();
        config.session.ring_capacity = Some(0);
        assert_eq!(config.transport_config().capacity, TransportConfig::default().capacity);
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.connection.serial.is_none());
        assert!(config.vars.is_empty());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.port.connection.serial = Some("COM5".to_string());
        config.session.ring_capacity = Some(4096);

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.port.connection.serial.as_deref(), Some("COM5"));
        assert_eq!(deserialized.session.ring_capacity, Some(4096));
    }

    // ---- load_from_path with tempfile ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.toml");
        fs::write(&path, r#"
[port.connection]
serial = "/dev/ttyACM0"
[vars]
file = "update.bin"
"#).unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.vars["file"], "update.bin");
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.port.connection.serial.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.port.connection.serial.is_none());
    }

    #[test]
    fn test_global_config_path_names_atlink() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("atlink"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
