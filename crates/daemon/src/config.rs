//! Configuration management for the tbauth daemon and CLI.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `/etc/tbauth/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tbauth/config.toml";

/// Default store root, holding `devices/` and `keys/`.
pub const DEFAULT_STORE_ROOT: &str = "/var/lib/tbauth";

/// Default sysfs mount point.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("store root must be an absolute path, got {0}")]
    RelativeStoreRoot(String),

    #[error("sysfs root must be an absolute path, got {0}")]
    RelativeSysfsRoot(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Daemon behaviour.
    pub daemon: DaemonConfig,

    /// Persistent store location.
    pub store: StoreConfig,

    /// Kernel device tree location.
    pub sysfs: SysfsConfig,
}

/// Daemon behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Authorize newly attached devices whose stored policy is `auto`.
    pub auto_authorize: bool,
}

/// Persistent store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory containing `devices/` and `keys/`.
    pub root: PathBuf,
}

/// Sysfs configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SysfsConfig {
    /// Mount point of sysfs.
    pub root: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            auto_authorize: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORE_ROOT),
        }
    }
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SYSFS_ROOT),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TBAUTH_STORE_ROOT: Override the store root
    /// - TBAUTH_SYSFS_ROOT: Override the sysfs mount point
    /// - TBAUTH_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Returns the `(variable, value)` pairs that were applied. Overrides
    /// are applied before logging is configured, so the caller reports them.
    pub fn apply_env_overrides(&mut self) -> Vec<(&'static str, String)> {
        let mut applied = Vec::new();

        if let Some(root) = non_empty_env("TBAUTH_STORE_ROOT") {
            self.store.root = PathBuf::from(&root);
            applied.push(("TBAUTH_STORE_ROOT", root));
        }

        if let Some(root) = non_empty_env("TBAUTH_SYSFS_ROOT") {
            self.sysfs.root = PathBuf::from(&root);
            applied.push(("TBAUTH_SYSFS_ROOT", root));
        }

        if let Some(level) = non_empty_env("TBAUTH_LOG_LEVEL") {
            self.daemon.log_level.clone_from(&level);
            applied.push(("TBAUTH_LOG_LEVEL", level));
        }

        applied
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.store.root.is_absolute() {
            return Err(ConfigError::RelativeStoreRoot(
                self.store.root.display().to_string(),
            ));
        }

        if !self.sysfs.root.is_absolute() {
            return Err(ConfigError::RelativeSysfsRoot(
                self.sysfs.root.display().to_string(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
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

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
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

    unsafe fn set_env(name: &str, value: &str) {
        // SAFETY: only called from #[serial] tests
        unsafe { std::env::set_var(name, value) };
    }

    unsafe fn remove_env(name: &str) {
        // SAFETY: only called from #[serial] tests
        unsafe { std::env::remove_var(name) };
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.auto_authorize);
        assert_eq!(config.store.root, PathBuf::from("/var/lib/tbauth"));
        assert_eq!(config.sysfs.root, PathBuf::from("/sys"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
auto_authorize = false

[store]
root = "/srv/tbauth"

[sysfs]
root = "/tmp/fake-sys"
"#;

        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert!(!config.daemon.auto_authorize);
        assert_eq!(config.store.root, PathBuf::from("/srv/tbauth"));
        assert_eq!(config.sysfs.root, PathBuf::from("/tmp/fake-sys"));
    }

    #[test]
    fn test_parse_partial_config_uses_defaults() {
        let config = Config::from_toml("[store]\nroot = \"/data\"\n").unwrap();
        assert_eq!(config.store.root, PathBuf::from("/data"));
        assert_eq!(config.sysfs.root, PathBuf::from("/sys"));
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = Config::from_toml("[store\nroot = ");
        assert!(result.is_err());
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_load_nonexistent_file_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[daemon]\nlog_level = \"warn\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let restored = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_validate_relative_store_root() {
        let mut config = Config::default();
        config.store.root = PathBuf::from("var/lib/tbauth");
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelativeStoreRoot("var/lib/tbauth".to_string()))
        );
    }

    #[test]
    fn test_validate_relative_sysfs_root() {
        let mut config = Config::default();
        config.sysfs.root = PathBuf::from("sys");
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelativeSysfsRoot("sys".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        unsafe {
            set_env("TBAUTH_STORE_ROOT", "/tmp/store");
            set_env("TBAUTH_SYSFS_ROOT", "/tmp/sys");
            set_env("TBAUTH_LOG_LEVEL", "trace");
        }

        let mut config = Config::default();
        let applied = config.apply_env_overrides();

        unsafe {
            remove_env("TBAUTH_STORE_ROOT");
            remove_env("TBAUTH_SYSFS_ROOT");
            remove_env("TBAUTH_LOG_LEVEL");
        }

        assert_eq!(config.store.root, PathBuf::from("/tmp/store"));
        assert_eq!(config.sysfs.root, PathBuf::from("/tmp/sys"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(
            applied,
            vec![
                ("TBAUTH_STORE_ROOT", "/tmp/store".to_string()),
                ("TBAUTH_SYSFS_ROOT", "/tmp/sys".to_string()),
                ("TBAUTH_LOG_LEVEL", "trace".to_string()),
            ]
        );
    }

    #[test]
    #[serial]
    fn test_empty_env_is_ignored() {
        unsafe { set_env("TBAUTH_STORE_ROOT", "") };

        let mut config = Config::default();
        let applied = config.apply_env_overrides();

        unsafe { remove_env("TBAUTH_STORE_ROOT") };

        assert!(applied.is_empty());
        assert_eq!(config.store.root, PathBuf::from(DEFAULT_STORE_ROOT));
    }
}
