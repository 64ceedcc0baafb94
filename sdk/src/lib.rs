//! Pelorus SDK
//!
//! Shared types for the Pelorus plugin runtime: the error taxonomy, package
//! descriptor and capability types, telemetry deltas, and the JSON shapes
//! exchanged with guests across the host-call boundary.

pub mod errors;
pub mod manifest;
pub mod types;

pub use errors::{PelorusErrorExt, RuntimeError};
pub use manifest::{Capabilities, PackageDescriptor, PluginManifest, StorageMode};
pub use types::{Delta, HostCallError, HostErrorCode, HostResult, PathValue, PluginConfigFile,
    PluginStatus, PluginSummary};
