//! Configuration management for ifdhandler.
//!
//! Uses figment to merge configuration from multiple sources:
//! 1. Default values
//! 2. Config file (TOML)
//! 3. Environment variables
//! 4. Command-line arguments

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Readers, in unit order
    #[serde(default)]
    pub reader: Vec<ReaderConfig>,
}

/// Daemon-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding reader sockets and the status file
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Maximum number of concurrent clients per reader
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Card status polling period in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// One configured reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Display name, used in logs only; the driver reports the real one
    #[serde(default)]
    pub name: String,

    /// Registered driver name
    pub driver: String,

    /// Transport address passed to the driver
    #[serde(default)]
    pub device: String,
}

fn default_socket_dir() -> PathBuf {
    openct_protocol::get_socket_dir()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_clients() -> usize {
    64
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_file: Option<&PathBuf>) -> Result<Self, figment::Error> {
        Self::figment(config_file).extract()
    }

    fn figment(config_file: Option<&PathBuf>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        } else {
            let default_paths = [
                PathBuf::from("/etc/openct.toml"),
                dirs::config_dir()
                    .unwrap_or_default()
                    .join("openct/config.toml"),
            ];

            for path in &default_paths {
                if path.exists() {
                    figment = figment.merge(Toml::file(path));
                    break;
                }
            }
        }

        // Nesting uses a double underscore: OPENCT_DAEMON__LOG_LEVEL
        figment.merge(Env::prefixed("OPENCT_").split("__"))
    }

    /// Override socket directory from CLI
    pub fn with_socket_dir(mut self, socket_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = socket_dir {
            self.daemon.socket_dir = dir;
        }
        self
    }

    /// Override log level from CLI
    pub fn with_log_level(mut self, log_level: Option<String>) -> Self {
        if let Some(level) = log_level {
            self.daemon.log_level = level;
        }
        self
    }

    /// Reader `index`, if configured.
    pub fn reader(&self, index: usize) -> Option<&ReaderConfig> {
        self.reader.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.max_clients, 64);
        assert_eq!(config.daemon.poll_interval(), Duration::from_secs(1));
        assert!(config.reader.is_empty());
    }

    #[test]
    fn test_config_override_socket_dir() {
        let config = Config::default().with_socket_dir(Some(PathBuf::from("/tmp/openct")));
        assert_eq!(config.daemon.socket_dir, PathBuf::from("/tmp/openct"));
    }

    #[test]
    fn test_config_override_log_level() {
        let config = Config::default().with_log_level(Some("debug".to_string()));
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_load_readers_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[daemon]
max_clients = 4

[[reader]]
name = "desk"
driver = "virtual"
device = "pin=0000"

[[reader]]
driver = "virtual"
"#
        )
        .unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.daemon.max_clients, 4);
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.reader.len(), 2);
        assert_eq!(config.reader(0).unwrap().device, "pin=0000");
        assert_eq!(config.reader(1).unwrap().name, "");
        assert!(config.reader(2).is_none());
    }

    #[test]
    fn test_malformed_file_names_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[reader]]\nname = \"no driver\"").unwrap();

        let err = Config::load(Some(&file.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("driver"));
    }
}
