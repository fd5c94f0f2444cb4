use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::{InputMode, DEFAULT_MAX_LINE_BYTES};

/// Top-level relay config, loaded from TOML. Every field has a default, so
/// an empty or missing file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub relay: RelaySettings,
    pub ssh: SshSettings,
}

/// `[server]` section: the HTTP/WebSocket listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Browser origins allowed to open a WebSocket. Empty means same-origin
    /// and non-browser clients only; `"*"` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Concurrent WebSocket connections before upgrades are refused.
    pub max_channels: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3001)),
            allowed_origins: Vec::new(),
            max_channels: 256,
        }
    }
}

/// `[relay]` section: session behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub input_mode: InputMode,
    pub max_sessions_per_channel: usize,
    /// Line mode sends an unterminated line once it grows this long.
    pub max_line_bytes: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            input_mode: InputMode::Line,
            max_sessions_per_channel: 16,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// `[ssh]` section: outbound connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub connect_timeout_secs: u64,
    /// Upper bound on one `POST /api/exec` command, from channel open to exit.
    pub exec_timeout_secs: u64,
    /// Zero disables keepalives.
    pub keepalive_interval_secs: u64,
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            exec_timeout_secs: 60,
            keepalive_interval_secs: 30,
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0)
            .then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

impl RelayConfig {
    /// Load config from a TOML file path. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_channels == 0 {
            return Err(ConfigError::Invalid("server.max_channels must be at least 1"));
        }
        if self.relay.max_sessions_per_channel == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_sessions_per_channel must be at least 1",
            ));
        }
        if self.relay.max_line_bytes == 0 {
            return Err(ConfigError::Invalid("relay.max_line_bytes must be at least 1"));
        }
        if self.ssh.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ssh.connect_timeout_secs must be at least 1"));
        }
        if self.ssh.exec_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ssh.exec_timeout_secs must be at least 1"));
        }
        if self.ssh.cols == 0 || self.ssh.rows == 0 {
            return Err(ConfigError::Invalid("ssh.cols and ssh.rows must be non-zero"));
        }
        Ok(())
    }
}

/// Default config location: `<config dir>/wssh/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("wssh").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(reason) => write!(f, "Invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.server.bind.port(), 3001);
        assert_eq!(config.relay.input_mode, InputMode::Line);
        assert_eq!(config.relay.max_sessions_per_channel, 16);
        assert_eq!(config.relay.max_line_bytes, DEFAULT_MAX_LINE_BYTES);
        assert_eq!(config.ssh.exec_timeout(), Duration::from_secs(60));
        assert_eq!(config.ssh.term, "xterm-256color");
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:8022"
            allowed_origins = ["http://localhost:3000", "*"]
            max_channels = 8

            [relay]
            input_mode = "raw"
            max_sessions_per_channel = 2
            max_line_bytes = 512

            [ssh]
            connect_timeout_secs = 3
            exec_timeout_secs = 20
            keepalive_interval_secs = 0
            term = "vt100"
            cols = 132
            rows = 43
        "#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8022".parse().unwrap());
        assert_eq!(config.server.allowed_origins.len(), 2);
        assert_eq!(config.server.max_channels, 8);
        assert_eq!(config.relay.input_mode, InputMode::Raw);
        assert_eq!(config.relay.max_line_bytes, 512);
        assert_eq!(config.ssh.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.ssh.exec_timeout(), Duration::from_secs(20));
        assert_eq!(config.ssh.keepalive_interval(), None);
        assert_eq!((config.ssh.cols, config.ssh.rows), (132, 43));
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: RelayConfig = toml::from_str("[ssh]\ncols = 100\n").unwrap();
        assert_eq!(config.ssh.cols, 100);
        assert_eq!(config.ssh.rows, 24);
        assert_eq!(config.ssh.keepalive_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn unknown_input_mode_is_rejected() {
        assert!(toml::from_str::<RelayConfig>("[relay]\ninput_mode = \"cooked\"\n").is_err());
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay]\nmax_sessions_per_channel = 3\n").unwrap();
        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.relay.max_sessions_per_channel, 3);
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\n").unwrap();
        let err = RelayConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn load_rejects_zero_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay]\nmax_sessions_per_channel = 0\n").unwrap();
        assert!(matches!(
            RelayConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_line_limit_and_exec_timeout_are_rejected() {
        let mut config = RelayConfig::default();
        config.relay.max_line_bytes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RelayConfig::default();
        config.ssh.exec_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn default_path_ends_in_wssh_config() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("wssh/config.toml"));
        }
    }
}
