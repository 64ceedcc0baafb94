//! Runtime settings
//!
//! This module handles loading and validation of the Pelorus runtime
//! settings. Settings are stored in TOML format at `~/.pelorus/pelorus.toml`
//! and every field has a default, so a missing file simply yields the
//! default configuration.
//!
//! # Sections
//!
//! - **core**: config root, package directory, HTTP bind address
//! - **lifecycle**: start/stop timeouts, crash backoff, grace window
//! - **bridge**: fetch timeout, delta buffer capacity, tmp sweep interval
//!
//! # Example
//!
//! ```toml
//! [core]
//! config_root = "~/.pelorus"
//! package_dir = "~/.pelorus/packages"
//! http_addr = "127.0.0.1:3858"
//!
//! [lifecycle]
//! start_timeout_ms = 10000
//! backoff_initial_ms = 1000
//! backoff_cap_ms = 30000
//! ```

use sdk::errors::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Complete runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Core paths and bind address
    #[serde(default)]
    pub core: CoreSettings,

    /// Lifecycle timing and crash supervision
    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    /// Host-call bridge limits
    #[serde(default)]
    pub bridge: BridgeSettings,
}

/// Core paths and bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    /// Root directory for per-plugin storage (supports ~ expansion).
    #[serde(default = "default_config_root")]
    pub config_root: PathBuf,

    /// Directory scanned for installed plugin packages.
    #[serde(default = "default_package_dir")]
    pub package_dir: PathBuf,

    /// Bind address of the HTTP façade.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Log level (error, warn, info, debug, trace).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Lifecycle timing and crash supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Budget for the guest's `start` call.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Budget for the guest's `stop` call.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// First restart delay after a crash.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Upper bound on the restart delay.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Consecutive crashes after which automatic restart stops.
    #[serde(default = "default_max_consecutive_crashes")]
    pub max_consecutive_crashes: u32,

    /// How long an instance must stay running before the consecutive-crash
    /// counter resets.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

/// Host-call bridge limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Per-call budget for `http_fetch`.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Per-plugin reload buffer capacity (deltas).
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Maximum accepted guest log-message length (bytes).
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,

    /// Interval of the periodic `vfs/tmp` sweep.
    #[serde(default = "default_tmp_sweep_interval_secs")]
    pub tmp_sweep_interval_secs: u64,
}

fn default_config_root() -> PathBuf {
    base_dir()
}

fn default_package_dir() -> PathBuf {
    base_dir().join("packages")
}

fn default_http_addr() -> String {
    "127.0.0.1:3858".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_max_consecutive_crashes() -> u32 {
    3
}

fn default_grace_period_ms() -> u64 {
    30_000
}

fn default_fetch_timeout_ms() -> u64 {
    15_000
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_max_log_bytes() -> usize {
    2048
}

fn default_tmp_sweep_interval_secs() -> u64 {
    3600
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pelorus")
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            config_root: default_config_root(),
            package_dir: default_package_dir(),
            http_addr: default_http_addr(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_consecutive_crashes: default_max_consecutive_crashes(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
            buffer_capacity: default_buffer_capacity(),
            max_log_bytes: default_max_log_bytes(),
            tmp_sweep_interval_secs: default_tmp_sweep_interval_secs(),
        }
    }
}

impl Settings {
    /// Default settings file location (`~/.pelorus/pelorus.toml`).
    pub fn default_path() -> PathBuf {
        base_dir().join("pelorus.toml")
    }

    /// Load settings from a specific file.
    pub fn load_from_path(path: &Path) -> Result<Self, RuntimeError> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default() -> Result<Self, RuntimeError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.lifecycle.backoff_initial_ms, 1_000);
        assert_eq!(settings.lifecycle.backoff_cap_ms, 30_000);
        assert_eq!(settings.lifecycle.max_consecutive_crashes, 3);
        assert_eq!(settings.bridge.buffer_capacity, 256);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [lifecycle]
            start_timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(settings.lifecycle.start_timeout_ms, 2_500);
        assert_eq!(settings.lifecycle.stop_timeout_ms, 5_000);
        assert_eq!(settings.core.http_addr, "127.0.0.1:3858");
    }

    #[test]
    fn test_bad_toml_is_a_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pelorus.toml");
        fs::write(&path, "not = [valid").unwrap();
        let err = Settings::load_from_path(&path).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }
}
