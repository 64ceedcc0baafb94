//! Package descriptor and capability types
//!
//! A plugin is shipped as an installed package whose descriptor
//! (`package.json`) carries the `wasm-plugin` keyword, the relative path to
//! the compiled module, and the declared capability set. The registry scans
//! the package directory, filters on the keyword, and validates descriptors
//! into [`PluginManifest`]s before anything is loaded.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::RuntimeError;

/// Keyword that marks an installed package as a WASM plugin.
pub const WASM_PLUGIN_KEYWORD: &str = "wasm-plugin";

/// Raw package descriptor as found on disk.
///
/// Only the fields the runtime consumes are modeled; anything else in the
/// file is ignored. `wasm_manifest` is optional at parse time because the
/// package directory also contains non-plugin packages; it becomes required
/// once the `wasm-plugin` keyword is present (see [`PackageDescriptor::into_manifest`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDescriptor {
    /// Package name, namespace-qualified (e.g. `@acme/anchor-watch`).
    pub name: String,

    /// Package version.
    pub version: String,

    /// Package keywords; must contain [`WASM_PLUGIN_KEYWORD`] for the
    /// package to be treated as a plugin.
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Relative path to the compiled WASM binary.
    #[serde(rename = "wasmManifest")]
    pub wasm_manifest: Option<String>,

    /// Declared capability set. Absent means the defaults
    /// (`data_read`, `data_write`, `storage = vfs_only`).
    #[serde(rename = "wasmCapabilities", default)]
    pub wasm_capabilities: Capabilities,

    /// Descriptor schema version.
    #[serde(rename = "manifestVersion", default = "default_manifest_version")]
    pub manifest_version: String,
}

fn default_manifest_version() -> String {
    "1".to_string()
}

impl PackageDescriptor {
    /// Parse a descriptor from JSON text.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Whether this package is marked as a WASM plugin.
    pub fn is_wasm_plugin(&self) -> bool {
        self.keywords.iter().any(|k| k == WASM_PLUGIN_KEYWORD)
    }

    /// Validate the descriptor into a [`PluginManifest`], resolving the
    /// module path against `package_dir`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Manifest` if `wasmManifest` is missing, is an
    /// absolute path, or escapes the package directory.
    pub fn into_manifest(self, package_dir: &Path) -> Result<PluginManifest, RuntimeError> {
        let rel = self.wasm_manifest.ok_or_else(|| {
            RuntimeError::Manifest(format!(
                "package '{}' is marked wasm-plugin but has no wasmManifest field",
                self.name
            ))
        })?;

        let rel_path = PathBuf::from(&rel);
        if rel_path.is_absolute() {
            return Err(RuntimeError::Manifest(format!(
                "package '{}' declares an absolute wasmManifest path",
                self.name
            )));
        }
        if rel_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(RuntimeError::Manifest(format!(
                "package '{}' declares a wasmManifest path outside the package",
                self.name
            )));
        }

        Ok(PluginManifest {
            package_name: self.name,
            manifest_version: self.manifest_version,
            plugin_version: self.version,
            module_path: package_dir.join(rel_path),
            capabilities: self.wasm_capabilities,
            keywords: self.keywords,
        })
    }
}

/// Validated, immutable plugin manifest.
///
/// Produced from the package descriptor at registration time and retained
/// for the lifetime of the registry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique package name (namespace-qualified).
    pub package_name: String,
    /// Descriptor schema version.
    pub manifest_version: String,
    /// Version of the plugin package.
    pub plugin_version: String,
    /// Absolute path to the compiled module.
    pub module_path: PathBuf,
    /// Declared capability set.
    pub capabilities: Capabilities,
    /// Package keywords.
    pub keywords: Vec<String>,
}

/// Storage modes a plugin may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// The plugin gets a private virtual filesystem mounted as its root.
    #[default]
    VfsOnly,
    /// No filesystem access at all.
    None,
}

/// Declared capability set of a plugin.
///
/// A fixed record of named flags plus the storage enum, so grants are
/// exhaustively matched at every call site. The granted set is identical to
/// the declared set unless the host denies specific entries; the grant is
/// immutable for the lifetime of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// May subscribe to telemetry deltas.
    #[serde(default = "default_true")]
    pub data_read: bool,
    /// May publish telemetry deltas.
    #[serde(default = "default_true")]
    pub data_write: bool,
    /// Filesystem storage mode.
    #[serde(default)]
    pub storage: StorageMode,
    /// Outbound HTTP permitted.
    #[serde(default)]
    pub network: bool,
    /// Serial-port enumeration permitted.
    #[serde(default)]
    pub serial_ports: bool,
    /// May register PUT handlers for host paths.
    #[serde(default)]
    pub put_handlers: bool,
    /// Guest-declared HTTP routes are mounted by the façade.
    #[serde(default)]
    pub http_endpoints: bool,
    /// May register as authoritative provider for a resource type.
    #[serde(default)]
    pub resource_provider: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            data_read: true,
            data_write: true,
            storage: StorageMode::VfsOnly,
            network: false,
            serial_ports: false,
            put_handlers: false,
            http_endpoints: false,
            resource_provider: false,
        }
    }
}
