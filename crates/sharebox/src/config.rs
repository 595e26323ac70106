//! Configuration management for Sharebox.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sharebox/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use storage::StorageConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("storage root must be an absolute path, got {0}")]
    RelativeRoot(PathBuf),

    #[error("thumbnail dimension must be between 1 and 4096 pixels, got {0}")]
    InvalidThumbnailDimension(u32),

    #[error("thumbnail concurrency must be between 1 and 64, got {0}")]
    InvalidThumbnailConcurrency(usize),

    #[error("archive max_files must be greater than 0, got {0}")]
    InvalidArchiveMaxFiles(usize),

    #[error("archive max_bytes must be greater than 0, got {0}")]
    InvalidArchiveMaxBytes(u64),

    #[error("max_upload_bytes must be greater than 0, got {0}")]
    InvalidUploadLimit(u64),

    #[error("max_upload_bytes ({upload}) must not exceed max_request_bytes ({request})")]
    UploadExceedsRequest { upload: u64, request: u64 },

    #[error("request timeout must be between 1 and 3600 seconds, got {0}")]
    InvalidTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// An environment variable consulted by [`Config::apply_env_overrides`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    /// The value replaced the configured one.
    Applied { var: &'static str, value: String },
    /// The value was set but could not be used.
    Ignored { var: &'static str, value: String },
}

impl EnvOverride {
    /// Log this override through `tracing`.
    pub fn log(&self) {
        match self {
            Self::Applied { var, value } => {
                tracing::info!("Overriding configuration from environment: {}={}", var, value)
            }
            Self::Ignored { var, value } => {
                tracing::warn!("Ignoring non-numeric {}: {}", var, value)
            }
        }
    }
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest accepted thumbnail dimension.
const MAX_THUMBNAIL_DIM: u32 = 4096;

/// Main configuration structure for Sharebox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub general: GeneralConfig,

    /// Storage engine configuration.
    pub storage: StorageConfig,

    /// Upload size limits.
    pub upload: UploadConfig,

    /// Per-request limits.
    pub request: RequestConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Upload size limits, enforced before data reaches the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum size of a single uploaded file in bytes (default: 100MB).
    pub max_upload_bytes: u64,

    /// Maximum size of a whole request body in bytes (default: 500MB).
    pub max_request_bytes: u64,
}

/// Per-request limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Deadline for thumbnail and archive operations, in seconds.
    pub timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 100 * 1024 * 1024, // 100MB
            max_request_bytes: 500 * 1024 * 1024, // 500MB
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

impl RequestConfig {
    /// The request deadline as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sharebox")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHAREBOX_ROOT: Override the storage root
    /// - SHAREBOX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SHAREBOX_PUID / SHAREBOX_PGID: Owner applied to created files
    ///
    /// Runs before logging is initialised, so the outcome is returned for
    /// the caller to log instead of being logged here.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut applied = Vec::new();

        if let Some(root) = env_value("SHAREBOX_ROOT") {
            self.storage.root = PathBuf::from(&root);
            applied.push(EnvOverride::Applied {
                var: "SHAREBOX_ROOT",
                value: root,
            });
        }

        if let Some(level) = env_value("SHAREBOX_LOG_LEVEL") {
            self.general.log_level = level.clone();
            applied.push(EnvOverride::Applied {
                var: "SHAREBOX_LOG_LEVEL",
                value: level,
            });
        }

        if let Some(uid) = env_id("SHAREBOX_PUID", &mut applied) {
            self.storage.uid = Some(uid);
        }

        if let Some(gid) = env_id("SHAREBOX_PGID", &mut applied) {
            self.storage.gid = Some(gid);
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.storage.root.is_absolute() {
            return Err(ConfigError::RelativeRoot(self.storage.root.clone()));
        }

        let thumbnail = &self.storage.thumbnail;
        for dim in [thumbnail.share_max_dim, thumbnail.admin_max_dim] {
            if dim == 0 || dim > MAX_THUMBNAIL_DIM {
                return Err(ConfigError::InvalidThumbnailDimension(dim));
            }
        }

        if thumbnail.concurrency < 1 || thumbnail.concurrency > 64 {
            return Err(ConfigError::InvalidThumbnailConcurrency(
                thumbnail.concurrency,
            ));
        }

        if self.storage.archive.max_files == 0 {
            return Err(ConfigError::InvalidArchiveMaxFiles(
                self.storage.archive.max_files,
            ));
        }

        if self.storage.archive.max_bytes == 0 {
            return Err(ConfigError::InvalidArchiveMaxBytes(
                self.storage.archive.max_bytes,
            ));
        }

        if self.upload.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidUploadLimit(self.upload.max_upload_bytes));
        }

        if self.upload.max_upload_bytes > self.upload.max_request_bytes {
            return Err(ConfigError::UploadExceedsRequest {
                upload: self.upload.max_upload_bytes,
                request: self.upload.max_request_bytes,
            });
        }

        if self.request.timeout_secs < 1 || self.request.timeout_secs > 3600 {
            return Err(ConfigError::InvalidTimeout(self.request.timeout_secs));
        }

        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
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

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Non-empty value of `var`, if set.
fn env_value(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// Read a numeric id from `var`; unparsable values are recorded as ignored.
fn env_id(var: &'static str, applied: &mut Vec<EnvOverride>) -> Option<u32> {
    let value = env_value(var)?;
    match value.parse() {
        Ok(id) => {
            applied.push(EnvOverride::Applied { var, value });
            Some(id)
        }
        Err(_) => {
            applied.push(EnvOverride::Ignored { var, value });
            None
        }
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
        for var in [
            "SHAREBOX_ROOT",
            "SHAREBOX_LOG_LEVEL",
            "SHAREBOX_PUID",
            "SHAREBOX_PGID",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.general.log_level, "info");
        assert!(config.general.log_file.is_none());
        assert_eq!(config.storage.root, PathBuf::from("/data"));
        assert_eq!(config.storage.thumbnail.share_max_dim, 200);
        assert_eq!(config.storage.thumbnail.admin_max_dim, 320);
        assert_eq!(config.storage.thumbnail.concurrency, 4);
        assert_eq!(config.storage.archive.max_files, 500);
        assert_eq!(config.storage.archive.max_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.upload.max_upload_bytes, 100 * 1024 * 1024);
        assert_eq!(config.upload.max_request_bytes, 500 * 1024 * 1024);
        assert_eq!(config.request.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[general]
log_level = "debug"

[storage]
root = "/srv/share"
uid = 1000

[storage.thumbnail]
concurrency = 2

[storage.archive]
max_files = 50
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.storage.root, PathBuf::from("/srv/share"));
        assert_eq!(config.storage.uid, Some(1000));
        assert_eq!(config.storage.gid, None);
        assert_eq!(config.storage.thumbnail.concurrency, 2);
        assert_eq!(config.storage.thumbnail.share_max_dim, 200);
        assert_eq!(config.storage.archive.max_files, 50);
        assert_eq!(config.storage.archive.max_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.upload, UploadConfig::default());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[storage\nroot = ");
        assert!(result.is_err());
        let message = result.unwrap_err().to_string();
        assert!(message.contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[request]
timeout_secs = "sixty"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.general.log_file = Some(PathBuf::from("/var/log/sharebox.log"));
        config.storage.root = PathBuf::from("/srv/files");
        config.storage.gid = Some(100);
        config.storage.thumbnail.sweep_max_age_secs = Some(86_400);
        config.request.timeout_secs = 120;

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/config.toml");

        let mut config = Config::default();
        config.upload.max_upload_bytes = 1024;
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not valid toml [[[").unwrap();

        let message = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(message.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("sharebox/config.toml"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[general]
log_level = "warn"
future_option = true
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.general.log_level, "warn");
    }

    #[test]
    #[serial]
    fn test_env_override_root_and_level() {
        clear_env();
        std::env::set_var("SHAREBOX_ROOT", "/mnt/share");
        std::env::set_var("SHAREBOX_LOG_LEVEL", "debug");

        let mut config = Config::default();
        let applied = config.apply_env_overrides();

        assert_eq!(config.storage.root, PathBuf::from("/mnt/share"));
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(
            applied,
            vec![
                EnvOverride::Applied {
                    var: "SHAREBOX_ROOT",
                    value: "/mnt/share".to_string()
                },
                EnvOverride::Applied {
                    var: "SHAREBOX_LOG_LEVEL",
                    value: "debug".to_string()
                },
            ]
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("SHAREBOX_ROOT", "");
        std::env::set_var("SHAREBOX_LOG_LEVEL", "");

        let mut config = Config::default();
        let applied = config.apply_env_overrides();

        assert_eq!(config, Config::default());
        assert!(applied.is_empty());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_ids() {
        clear_env();
        std::env::set_var("SHAREBOX_PUID", "1000");
        std::env::set_var("SHAREBOX_PGID", "not-a-number");

        let mut config = Config::default();
        let applied = config.apply_env_overrides();

        assert_eq!(config.storage.uid, Some(1000));
        assert_eq!(config.storage.gid, None);
        assert_eq!(
            applied[1],
            EnvOverride::Ignored {
                var: "SHAREBOX_PGID",
                value: "not-a-number".to_string()
            }
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        config.storage.root = PathBuf::from("/from/file");
        assert!(config.apply_env_overrides().is_empty());

        assert_eq!(config.storage.root, PathBuf::from("/from/file"));
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_relative_root() {
        let mut config = Config::default();
        config.storage.root = PathBuf::from("data");
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelativeRoot(PathBuf::from("data")))
        );
    }

    #[test]
    fn test_validate_thumbnail_bounds() {
        let mut config = Config::default();
        config.storage.thumbnail.share_max_dim = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidThumbnailDimension(0))
        );

        let mut config = Config::default();
        config.storage.thumbnail.admin_max_dim = 5000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidThumbnailDimension(5000))
        );

        let mut config = Config::default();
        config.storage.thumbnail.concurrency = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidThumbnailConcurrency(0))
        );

        config.storage.thumbnail.concurrency = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_archive_limits() {
        let mut config = Config::default();
        config.storage.archive.max_files = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidArchiveMaxFiles(0)));

        let mut config = Config::default();
        config.storage.archive.max_bytes = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidArchiveMaxBytes(0)));
    }

    #[test]
    fn test_validate_upload_limits() {
        let mut config = Config::default();
        config.upload.max_upload_bytes = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidUploadLimit(0)));

        let mut config = Config::default();
        config.upload.max_upload_bytes = 600;
        config.upload.max_request_bytes = 500;
        assert_eq!(
            config.validate(),
            Err(ConfigError::UploadExceedsRequest {
                upload: 600,
                request: 500
            })
        );
    }

    #[test]
    fn test_validate_timeout() {
        let mut config = Config::default();
        config.request.timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout(0)));

        config.request.timeout_secs = 3601;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout(3601)));

        config.request.timeout_secs = 3600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.general.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.general.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }
}
