//! TOML-based configuration persistence for the host.
//!
//! The default location is platform dependent:
//! - Windows:  `%APPDATA%\keylink\config.toml`
//! - Linux:    `~/.config/keylink/config.toml`
//! - macOS:    `~/Library/Application Support/keylink/config.toml`
//!
//! ```toml
//! [link]
//! max_chunk_size = 255
//! get_response_limit = 64
//!
//! [arbiter]
//! skip_redundant_select = false
//!
//! [logging]
//! log_level = "info"
//! ```
//!
//! Every section and field may be omitted; missing values fall back to the
//! defaults below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::arbiter::ArbiterOptions;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level host configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Frame encoding settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkConfig {
    /// Forces extended length encoding on or off.  Absent: ask the transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_length: Option<bool>,
    /// Data bytes per chained frame; clamped to `1..=255`.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// GET RESPONSE rounds allowed before an exchange is abandoned.
    #[serde(default = "default_get_response_limit")]
    pub get_response_limit: usize,
}

/// Session arbitration settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArbiterConfig {
    /// Skip SELECT when the requested application is already selected.
    #[serde(default)]
    pub skip_redundant_select: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_max_chunk_size() -> usize {
    255
}
fn default_get_response_limit() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            extended_length: None,
            max_chunk_size: default_max_chunk_size(),
            get_response_limit: default_get_response_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl From<&HostConfig> for ArbiterOptions {
    fn from(config: &HostConfig) -> Self {
        Self {
            extended_length: config.link.extended_length,
            max_chunk_size: config.link.max_chunk_size.clamp(1, 255),
            get_response_limit: config.link.get_response_limit,
            skip_redundant_select: config.arbiter.skip_redundant_select,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    let dir = platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)?;
    Ok(dir.join("config.toml"))
}

/// Loads `HostConfig` from `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read (including when it
/// does not exist) and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<HostConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Loads `HostConfig` from `path`, returning the default if the file does not
/// exist yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_or_default(path: &Path) -> Result<HostConfig, ConfigError> {
    match load_config(path) {
        Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            Ok(HostConfig::default())
        }
        other => other,
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &HostConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("keylink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("keylink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("keylink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("keylink-config-{}", Uuid::new_v4()))
    }

    #[test]
    fn test_host_config_default_matches_arbiter_defaults() {
        // Arrange / Act
        let cfg = HostConfig::default();

        // Assert
        assert_eq!(ArbiterOptions::from(&cfg), ArbiterOptions::default());
        assert_eq!(cfg.logging.log_level, "info");
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: HostConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, HostConfig::default());
    }

    #[test]
    fn test_partial_link_section_overrides_defaults() {
        // Arrange
        let toml_str = r#"
[link]
extended_length = true
max_chunk_size = 64

[arbiter]
skip_redundant_select = true
"#;

        // Act
        let cfg: HostConfig = toml::from_str(toml_str).expect("deserialize partial");
        let options = ArbiterOptions::from(&cfg);

        // Assert
        assert_eq!(options.extended_length, Some(true));
        assert_eq!(options.max_chunk_size, 64);
        assert_eq!(options.get_response_limit, 64);
        assert!(options.skip_redundant_select);
        assert_eq!(cfg.logging.log_level, "info");
    }

    #[test]
    fn test_chunk_size_is_clamped() {
        let mut cfg = HostConfig::default();
        cfg.link.max_chunk_size = 4096;
        assert_eq!(ArbiterOptions::from(&cfg).max_chunk_size, 255);

        cfg.link.max_chunk_size = 0;
        assert_eq!(ArbiterOptions::from(&cfg).max_chunk_size, 1);
    }

    #[test]
    fn test_unset_extended_length_is_omitted_from_toml() {
        let toml_str = toml::to_string_pretty(&HostConfig::default()).expect("serialize");
        assert!(!toml_str.contains("extended_length"));
    }

    #[test]
    fn test_save_then_load_round_trips() {
        // Arrange
        let dir = temp_dir();
        let path = dir.join("nested").join("config.toml");
        let mut cfg = HostConfig::default();
        cfg.link.get_response_limit = 8;
        cfg.logging.log_level = "debug".to_string();

        // Act
        save_config(&path, &cfg).expect("save");
        let restored = load_config(&path).expect("load");

        // Assert
        assert_eq!(restored, cfg);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_is_error_for_load_and_default_for_load_or_default() {
        let path = temp_dir().join("absent.toml");

        assert!(matches!(load_config(&path), Err(ConfigError::Io { .. })));
        assert_eq!(
            load_config_or_default(&path).expect("default"),
            HostConfig::default()
        );
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        // Arrange
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("config.toml");
        std::fs::write(&path, "[link\nmax_chunk_size = ").expect("write");

        // Act
        let result = load_config_or_default(&path);

        // Assert
        assert!(matches!(result, Err(ConfigError::Parse(_))));
        let _ = std::fs::remove_dir_all(dir);
    }
}
