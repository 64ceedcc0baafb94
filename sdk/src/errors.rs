//! Error types and handling
//!
//! This module provides the error types used throughout the Pelorus runtime.
//! All errors implement the `PelorusErrorExt` trait which provides
//! user-friendly hints and indicates whether errors are recoverable.
//!
//! # Error discipline
//!
//! Inside the runtime, errors are tagged values carried in `Result`s, never
//! control-flow exceptions. Across the guest boundary, errors are encoded as
//! JSON result envelopes (see [`crate::types::HostResult`]); the host never
//! unwinds into a guest and a guest trap never unwinds a host thread.

use thiserror::Error;

/// Trait for Pelorus error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All runtime errors implement it.
pub trait PelorusErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to operators and does not contain
    /// filesystem paths or internal implementation details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require operator intervention (fixing a package,
    /// reloading a plugin manually).
    fn is_recoverable(&self) -> bool;
}

/// Main runtime error type
///
/// Each variant corresponds to one row of the runtime's error taxonomy:
///
/// - **Manifest**: the package descriptor is missing or invalid; the plugin
///   is never registered.
/// - **Load**: module compile/instantiation failed or a required export is
///   missing; partial state is rolled back.
/// - **Start**: the guest's `start` returned non-zero or trapped; the record
///   lands in `Error` status and is not counted as a crash.
/// - **Crash**: a post-start fault (guest trap, host-call violation); counted
///   and supervised with exponential backoff.
/// - **PermissionDenied**: a host call outside the capability grant; returned
///   to the guest as an error code, logged once per plugin per capability.
/// - **Config / ConfigWrite**: persisted-config read and write failures.
/// - **Timeout**: a bounded guest or outbound call overran its budget.
#[derive(Debug, Error)]
pub enum RuntimeError {
    // Package descriptor errors
    #[error("Manifest error: {0}")]
    Manifest(String),

    // Module load errors
    #[error("Load error: {0}")]
    Load(String),

    #[error("Required export missing: {0}")]
    MissingExport(String),

    // Lifecycle errors
    #[error("Start failed (code {code}): {message}")]
    Start { code: i32, message: String },

    #[error("Plugin crashed: {0}")]
    Crash(String),

    #[error("Plugin not registered: {0}")]
    NotRegistered(String),

    #[error("Plugin not running: {0}")]
    NotRunning(String),

    #[error("Duplicate plugin id: {0}")]
    DuplicateId(String),

    // Capability errors
    #[error("Permission denied: capability '{capability}' not granted")]
    PermissionDenied { capability: String },

    // Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config write failed: {0}")]
    ConfigWrite(String),

    // Input validation at the host boundary
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Storage errors
    #[error("Invalid plugin id: {0}")]
    InvalidPluginId(String),

    // Outbound HTTP errors
    #[error("Fetch error: {0}")]
    Fetch(String),

    // Timeouts (start/stop/fetch budgets)
    #[error("Timed out: {0}")]
    Timeout(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PelorusErrorExt for RuntimeError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Manifest(_) => "Check the package descriptor of the plugin",
            Self::Load(_) => "The plugin module could not be loaded. Reinstall the package",
            Self::MissingExport(_) => "The plugin module is missing a required export",

            Self::Start { .. } => "The plugin failed to start. Check its configuration",
            Self::Crash(_) => "The plugin crashed. It will be restarted automatically",
            Self::NotRegistered(_) => "No plugin with this id is registered",
            Self::NotRunning(_) => "The plugin is not running",
            Self::DuplicateId(_) => "Two installed packages resolve to the same plugin id",

            Self::PermissionDenied { .. } => "The plugin does not declare this capability",

            Self::Config(_) => "The plugin configuration could not be read",
            Self::ConfigWrite(_) => "The plugin configuration could not be persisted",

            Self::InvalidInput(_) => "The request was rejected by input validation",
            Self::InvalidPluginId(_) => {
                "Plugin ids may only contain letters, digits, '.', '_' and '-'"
            }

            Self::Fetch(_) => "Outbound HTTP request failed. Check the URL and network",
            Self::Timeout(_) => "The operation exceeded its time budget",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Registration-fatal errors need a fixed package or a reinstall
            Self::Manifest(_) | Self::Load(_) | Self::MissingExport(_) | Self::DuplicateId(_) => {
                false
            }

            // Everything else can be retried or cleared by a manual reload
            _ => true,
        }
    }
}
