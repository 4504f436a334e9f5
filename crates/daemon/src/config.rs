//! Configuration management for the Termlink daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termlink/config.toml`.
//! Values are read once at startup; the daemon never reloads them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("keep_alive_minutes must be at least 1, got {0}")]
    InvalidKeepAlive(u64),

    #[error("idle_timeout_secs must be at least 1, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("scrollback_bytes must be between 1024 and 16777216, got {0}")]
    InvalidScrollback(usize),

    #[error("port must not be 0")]
    InvalidPort,

    #[error("bind_address is not a valid IP address: {0}")]
    InvalidBindAddress(String),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("sandbox_root is not an existing directory: {0}")]
    InvalidSandboxRoot(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default port for the session gateway.
pub const DEFAULT_PORT: u16 = 7681;

/// Main configuration structure for the Termlink daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub network: NetworkConfig,

    /// Session lifecycle configuration.
    pub session: SessionConfig,

    /// Security settings.
    pub security: SecurityConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Listener configuration for the session gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the WebSocket listener to.
    pub bind_address: String,

    /// Port for the WebSocket listener.
    pub port: u16,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to run in new sessions.
    pub shell: String,

    /// Working directory when a client does not ask for one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cwd: Option<PathBuf>,

    /// Session working directories must lie under this directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_root: Option<PathBuf>,

    /// How long a session without a connection is kept.
    pub keep_alive_minutes: u64,

    /// Seconds of output silence before a session is reported idle.
    pub idle_timeout_secs: u64,

    /// Scrollback kept per session for replay on reattach.
    pub scrollback_bytes: usize,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
}

/// Security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared credential clients must present. Generated on first start
    /// when empty.
    pub token: String,

    /// Skip the token check for connections from a loopback address.
    pub trust_localhost: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_cwd: None,
            sandbox_root: None,
            keep_alive_minutes: 30,
            idle_timeout_secs: 3,
            scrollback_bytes: 50 * 1024,
            max_sessions: 32,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            trust_localhost: true,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termlink")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termlink")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Generates a fresh random token: 32 bytes, hex encoded.
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMLINK_TOKEN: Override the shared token
    /// - TERMLINK_PORT: Override the listener port
    /// - TERMLINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("TERMLINK_TOKEN") {
            if !token.is_empty() {
                tracing::info!("Overriding token from environment");
                self.security.token = token;
            }
        }

        if let Ok(port) = std::env::var("TERMLINK_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.network.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(_) => tracing::warn!("Ignoring invalid TERMLINK_PORT: {}", port),
            }
        }

        if let Ok(level) = std::env::var("TERMLINK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.keep_alive_minutes < 1 {
            return Err(ConfigError::InvalidKeepAlive(session.keep_alive_minutes));
        }

        if session.idle_timeout_secs < 1 {
            return Err(ConfigError::InvalidIdleTimeout(session.idle_timeout_secs));
        }

        if !(1024..=16 * 1024 * 1024).contains(&session.scrollback_bytes) {
            return Err(ConfigError::InvalidScrollback(session.scrollback_bytes));
        }

        if self.network.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self
            .network
            .bind_address
            .parse::<std::net::IpAddr>()
            .is_err()
        {
            return Err(ConfigError::InvalidBindAddress(
                self.network.bind_address.clone(),
            ));
        }

        let shell_path = Path::new(&session.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(session.shell.clone()));
            }
        } else if which::which(&session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(session.shell.clone()));
        }

        if let Some(root) = &session.sandbox_root {
            if !root.is_dir() {
                return Err(ConfigError::InvalidSandboxRoot(
                    root.display().to_string(),
                ));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Makes sure a token is configured, generating one if needed.
    ///
    /// Returns true when a new token was generated; the caller decides
    /// whether to persist it.
    pub fn ensure_token(&mut self) -> bool {
        if !self.security.token.is_empty() {
            return false;
        }
        self.security.token = generate_token();
        true
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist. The file holds the
    /// token, so on Unix it is written owner-readable only.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict config file: {}", path.display()))?;
        }

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("TERMLINK_TOKEN");
        std::env::remove_var("TERMLINK_PORT");
        std::env::remove_var("TERMLINK_LOG_LEVEL");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_dir.is_none());
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.network.port, 7681);
        assert_eq!(config.session.keep_alive_minutes, 30);
        assert_eq!(config.session.idle_timeout_secs, 3);
        assert_eq!(config.session.scrollback_bytes, 51200);
        assert_eq!(config.session.max_sessions, 32);
        assert!(config.session.sandbox_root.is_none());
        assert!(config.security.token.is_empty());
        assert!(config.security.trust_localhost);
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("termlink"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
keep_alive_minutes = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.keep_alive_minutes, 5);
        assert_eq!(config.session.idle_timeout_secs, 3);
        assert_eq!(config.network.port, DEFAULT_PORT);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"
log_dir = "/var/log/termlink"

[network]
bind_address = "127.0.0.1"
port = 9000

[session]
shell = "/bin/zsh"
default_cwd = "/home/me"
sandbox_root = "/home/me/code"
keep_alive_minutes = 60
idle_timeout_secs = 10
scrollback_bytes = 100000
max_sessions = 8

[security]
token = "abc123"
trust_localhost = false
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/var/log/termlink")));
        assert_eq!(config.network.bind_address, "127.0.0.1");
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.session.shell, "/bin/zsh");
        assert_eq!(config.session.default_cwd, Some(PathBuf::from("/home/me")));
        assert_eq!(
            config.session.sandbox_root,
            Some(PathBuf::from("/home/me/code"))
        );
        assert_eq!(config.session.keep_alive_minutes, 60);
        assert_eq!(config.session.idle_timeout_secs, 10);
        assert_eq!(config.session.scrollback_bytes, 100000);
        assert_eq!(config.session.max_sessions, 8);
        assert_eq!(config.security.token, "abc123");
        assert!(!config.security.trust_localhost);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[network]
port = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "warn"
retired_option = true

[future_section]
key = "value"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.session.sandbox_root = Some(PathBuf::from("/srv/projects"));
        original.security.token = "secret".to_string();
        original.security.trust_localhost = false;

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.network.port = 9999;
        config.security.token = "persisted".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        Config::default().save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[network\nport = 1").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("termlink/config.toml"));
    }

    #[test]
    fn test_ensure_token_generates_once() {
        let mut config = Config::default();
        assert!(config.ensure_token());
        let token = config.security.token.clone();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        assert!(!config.ensure_token());
        assert_eq!(config.security.token, token);
    }

    #[test]
    fn test_generated_tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    #[serial]
    fn test_env_override_token_and_port() {
        clear_env();
        std::env::set_var("TERMLINK_TOKEN", "from-env");
        std::env::set_var("TERMLINK_PORT", "8123");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.security.token, "from-env");
        assert_eq!(config.network.port, 8123);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_ignored() {
        clear_env();
        std::env::set_var("TERMLINK_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.port, DEFAULT_PORT);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("TERMLINK_TOKEN", "");
        std::env::set_var("TERMLINK_LOG_LEVEL", "");

        let mut config = Config::default();
        config.security.token = "file-token".to_string();
        config.apply_env_overrides();

        assert_eq!(config.security.token, "file-token");
        assert_eq!(config.daemon.log_level, "info");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("TERMLINK_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        clear_env();
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_validate_default_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = valid_config();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_timers() {
        let mut config = valid_config();
        config.session.keep_alive_minutes = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidKeepAlive(0)));

        let mut config = valid_config();
        config.session.idle_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidIdleTimeout(0)));
    }

    #[test]
    fn test_validate_scrollback_bounds() {
        let mut config = valid_config();
        config.session.scrollback_bytes = 100;
        assert_eq!(config.validate(), Err(ConfigError::InvalidScrollback(100)));

        config.session.scrollback_bytes = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_network() {
        let mut config = valid_config();
        config.network.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));

        let mut config = valid_config();
        config.network.bind_address = "localhost:80".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress(_))
        ));

        config.network.bind_address = "::1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = valid_config();
        config.session.shell = "/nonexistent/path/to/shell".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));

        config.session.shell = "sh".to_string();
        assert!(config.validate().is_ok());

        config.session.shell = "nonexistent_shell_binary_12345".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    fn test_validate_sandbox_root() {
        let temp_dir = TempDir::new().unwrap();

        let mut config = valid_config();
        config.session.sandbox_root = Some(temp_dir.path().to_path_buf());
        assert!(config.validate().is_ok());

        config.session.sandbox_root = Some(temp_dir.path().join("missing"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSandboxRoot(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.daemon.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
