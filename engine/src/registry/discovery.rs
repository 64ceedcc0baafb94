//! Package discovery
//!
//! Scans the installed-package directory for plugin packages. Each package
//! lives in its own subdirectory with a `package.json` descriptor; only
//! packages carrying the `wasm-plugin` keyword are treated as plugins.
//! A package that fails to register is logged and skipped — one broken
//! package never blocks the rest of the scan.

use sdk::errors::RuntimeError;
use sdk::manifest::PackageDescriptor;
use std::path::Path;
use std::sync::Arc;

use super::Registry;

/// Descriptor filename inside each package directory.
const DESCRIPTOR_FILE: &str = "package.json";

/// Scan `package_dir` and register every wasm-plugin package found.
///
/// Returns the plugin ids that registered successfully. A missing package
/// directory is fine (no packages installed yet).
pub async fn scan_and_register(registry: &Arc<Registry>, package_dir: &Path) -> Vec<String> {
    let mut registered = Vec::new();

    let entries = match std::fs::read_dir(package_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "Package directory {} does not exist; no plugins to register",
                package_dir.display()
            );
            return registered;
        }
        Err(e) => {
            tracing::error!(
                "Failed to read package directory {}: {}",
                package_dir.display(),
                e
            );
            return registered;
        }
    };

    for entry in entries.flatten() {
        let package_path = entry.path();
        if !package_path.is_dir() {
            continue;
        }
        match register_package(registry, &package_path).await {
            Ok(Some(plugin_id)) => registered.push(plugin_id),
            Ok(None) => {} // not a wasm plugin
            Err(e) => {
                tracing::warn!(
                    "Failed to register package at {}: {} — skipping",
                    package_path.display(),
                    e
                );
            }
        }
    }

    tracing::info!("Registered {} plugin(s)", registered.len());
    registered
}

/// Register a single package directory. Returns `Ok(None)` when the package
/// is not marked as a wasm plugin.
pub async fn register_package(
    registry: &Arc<Registry>,
    package_dir: &Path,
) -> Result<Option<String>, RuntimeError> {
    let descriptor_path = package_dir.join(DESCRIPTOR_FILE);
    let text = std::fs::read_to_string(&descriptor_path).map_err(|e| {
        RuntimeError::Manifest(format!("{}: {e}", descriptor_path.display()))
    })?;
    let descriptor = PackageDescriptor::from_json(&text)
        .map_err(|e| RuntimeError::Manifest(format!("{}: {e}", descriptor_path.display())))?;

    if !descriptor.is_wasm_plugin() {
        return Ok(None);
    }

    let manifest = descriptor.into_manifest(package_dir)?;
    let plugin_id = registry.register(manifest).await?;
    Ok(Some(plugin_id))
}

/// List descriptors of wasm-plugin packages without registering anything.
/// Used by the CLI's `plugins` listing.
pub fn list_packages(package_dir: &Path) -> Vec<PackageDescriptor> {
    let mut packages = Vec::new();
    let Ok(entries) = std::fs::read_dir(package_dir) else {
        return packages;
    };
    for entry in entries.flatten() {
        let descriptor_path = entry.path().join(DESCRIPTOR_FILE);
        let Ok(text) = std::fs::read_to_string(&descriptor_path) else {
            continue;
        };
        match PackageDescriptor::from_json(&text) {
            Ok(descriptor) if descriptor.is_wasm_plugin() => packages.push(descriptor),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Skipping malformed descriptor {}: {}", descriptor_path.display(), e);
            }
        }
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    packages
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_package(dir: &Path, name: &str, descriptor: &str) {
        let package_dir = dir.join(name);
        fs::create_dir_all(&package_dir).unwrap();
        fs::write(package_dir.join(DESCRIPTOR_FILE), descriptor).unwrap();
    }

    #[test]
    fn test_list_packages_filters_on_keyword() {
        let dir = TempDir::new().unwrap();
        write_package(
            dir.path(),
            "anchor-watch",
            r#"{"name": "@pelorus/anchor-watch", "version": "1.0.0",
                "keywords": ["wasm-plugin"], "wasmManifest": "plugin.wasm"}"#,
        );
        write_package(
            dir.path(),
            "some-lib",
            r#"{"name": "some-lib", "version": "2.0.0"}"#,
        );
        write_package(dir.path(), "broken", "{ nope");

        let packages = list_packages(dir.path());
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "@pelorus/anchor-watch");
    }

    #[test]
    fn test_list_packages_missing_dir_is_empty() {
        assert!(list_packages(Path::new("/nonexistent/packages")).is_empty());
    }
}
