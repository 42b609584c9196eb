//! TOML-based configuration persistence for the bench director.
//!
//! Reads and writes `AppConfig` to an explicit path or to the
//! platform-appropriate config file:
//! - Windows:  `%APPDATA%\ConnectionsTester\config.toml`
//! - Linux:    `~/.config/connections-tester/config.toml`
//! - macOS:    `~/Library/Application Support/ConnectionsTester/config.toml`
//!
//! Example:
//!
//! ```toml
//! [tester]
//! log_level = "info"
//! output_voltage_level = "High(1.0V)"
//!
//! [network]
//! rendezvous_port = 1500
//! bind_address = "0.0.0.0"
//!
//! [director]
//! rediscovery_delay_ms = 3000
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "some_fn")]`, so a missing file, a
//! missing section, or a missing key all fall back to the built-in defaults.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tester_core::VoltageLevel;

use crate::application::director::{DirectorConfig, DEFAULT_BOARDS_CHANNEL_CAPACITY};
use crate::application::session::VoltagePreference;
use crate::infrastructure::network::admission::{
    AdmissionConfig, DEFAULT_HANDOFF_CAPACITY, DEFAULT_RENDEZVOUS_PORT,
};
use crate::infrastructure::network::link::DEFAULT_HEARTBEAT_PAYLOAD;

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

    /// `network.bind_address` is not an IP address.
    #[error("invalid bind address '{0}'")]
    InvalidBindAddress(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub tester: TesterConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub director: DirectorSection,
}

/// Operator preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TesterConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Preference label, `"Low(0.7V)"` or `"High(1.0V)"`.  Anything else
    /// means low.
    #[serde(default = "default_output_voltage_level")]
    pub output_voltage_level: String,
    /// Resistances above this many ohms are treated as open circuits.
    #[serde(default = "default_max_detectable_resistance")]
    pub max_detectable_resistance: f32,
}

/// Rendezvous listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// IP address to bind all sockets to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_rendezvous_port")]
    pub rendezvous_port: u16,
    #[serde(default = "default_rendezvous_timeout_ms")]
    pub rendezvous_timeout_ms: u64,
    /// Link heartbeats are sent every quarter of this period.
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,
}

/// Director tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectorSection {
    #[serde(default = "default_rediscovery_delay_ms")]
    pub rediscovery_delay_ms: u64,
    #[serde(default = "default_boards_channel_capacity")]
    pub boards_channel_capacity: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_output_voltage_level() -> String {
    VoltageLevel::LOW_PREFERENCE.to_string()
}
fn default_max_detectable_resistance() -> f32 {
    1000.0
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_rendezvous_port() -> u16 {
    DEFAULT_RENDEZVOUS_PORT
}
fn default_rendezvous_timeout_ms() -> u64 {
    4000
}
fn default_keepalive_timeout_ms() -> u64 {
    4000
}
fn default_handoff_capacity() -> usize {
    DEFAULT_HANDOFF_CAPACITY
}
fn default_rediscovery_delay_ms() -> u64 {
    3000
}
fn default_boards_channel_capacity() -> usize {
    DEFAULT_BOARDS_CHANNEL_CAPACITY
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            output_voltage_level: default_output_voltage_level(),
            max_detectable_resistance: default_max_detectable_resistance(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            rendezvous_port: default_rendezvous_port(),
            rendezvous_timeout_ms: default_rendezvous_timeout_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            handoff_capacity: default_handoff_capacity(),
        }
    }
}

impl Default for DirectorSection {
    fn default() -> Self {
        Self {
            rediscovery_delay_ms: default_rediscovery_delay_ms(),
            boards_channel_capacity: default_boards_channel_capacity(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl VoltagePreference for TesterConfig {
    fn preferred_level(&self) -> VoltageLevel {
        VoltageLevel::from_preference(&self.output_voltage_level)
    }
}

impl NetworkConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddress`] when `bind_address` does not
    /// parse as an IP address.
    pub fn to_admission_config(&self) -> Result<AdmissionConfig, ConfigError> {
        let bind_address: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind_address.clone()))?;

        Ok(AdmissionConfig {
            bind_address,
            rendezvous_port: self.rendezvous_port,
            rendezvous_timeout: Duration::from_millis(self.rendezvous_timeout_ms),
            keepalive_timeout: Duration::from_millis(self.keepalive_timeout_ms),
            handoff_capacity: self.handoff_capacity,
            heartbeat_payload: DEFAULT_HEARTBEAT_PAYLOAD.to_vec(),
        })
    }
}

impl DirectorSection {
    pub fn to_director_config(&self) -> DirectorConfig {
        DirectorConfig {
            rediscovery_delay: Duration::from_millis(self.rediscovery_delay_ms),
            boards_channel_capacity: self.boards_channel_capacity,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from `path`, or from the platform file when `None`,
/// returning `AppConfig::default()` if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io { path, source }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
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
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("ConnectionsTester"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("connections-tester"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("ConnectionsTester")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
