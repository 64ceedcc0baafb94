//! Per-plugin storage management
//!
//! Each registered plugin owns a storage subtree keyed by its plugin id:
//!
//! ```text
//! <config_root>/plugin-config-data/<plugin_id>/
//!   <plugin_id>.json      server-managed config (outside the sandbox)
//!   vfs/                  the plugin sees this directory as "/"
//!     data/  config/  tmp/
//! ```
//!
//! The guest is only ever pre-opened on `vfs/`; the sibling
//! `<plugin_id>.json` is written exclusively by the host, atomically
//! (temporary sibling, fsync, rename), so an external observer never sees a
//! truncated file.
//!
//! Plugin ids are validated before any path is derived from them; an id that
//! could change the directory layout (path separators, `..`, leading dots)
//! is rejected outright.

use sdk::errors::RuntimeError;
use sdk::types::PluginConfigFile;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory under the config root holding all plugin storage.
const PLUGIN_DATA_DIR: &str = "plugin-config-data";

/// Resolved filesystem layout for one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    /// `<config_root>/plugin-config-data/<plugin_id>/`
    pub root: PathBuf,
    /// `<root>/<plugin_id>.json`
    pub config_file: PathBuf,
    /// `<root>/vfs/` — mounted as the guest's `/`.
    pub vfs_root: PathBuf,
    /// `<vfs>/data/`
    pub data_dir: PathBuf,
    /// `<vfs>/config/`
    pub config_dir: PathBuf,
    /// `<vfs>/tmp/` — cleared on every plugin start.
    pub tmp_dir: PathBuf,
}

/// Validate a plugin id for use as a directory name.
///
/// Accepted: ASCII letters, digits, `.`, `_`, `-`; must be non-empty, must
/// not start with a dot. Everything else is rejected so a hostile id cannot
/// escape the storage root.
pub fn validate_plugin_id(plugin_id: &str) -> Result<(), RuntimeError> {
    if plugin_id.is_empty() || plugin_id.starts_with('.') {
        return Err(RuntimeError::InvalidPluginId(plugin_id.to_string()));
    }
    let ok = plugin_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !ok {
        return Err(RuntimeError::InvalidPluginId(plugin_id.to_string()));
    }
    Ok(())
}

/// Resolve the storage layout for a plugin. Pure; touches no filesystem.
pub fn resolve(plugin_id: &str, config_root: &Path) -> Result<StoragePaths, RuntimeError> {
    validate_plugin_id(plugin_id)?;
    let root = config_root.join(PLUGIN_DATA_DIR).join(plugin_id);
    let vfs_root = root.join("vfs");
    Ok(StoragePaths {
        config_file: root.join(format!("{plugin_id}.json")),
        data_dir: vfs_root.join("data"),
        config_dir: vfs_root.join("config"),
        tmp_dir: vfs_root.join("tmp"),
        vfs_root,
        root,
    })
}

/// Create the storage directories if absent. Idempotent; creation races
/// with a concurrent initializer are tolerated.
pub fn initialize(paths: &StoragePaths) -> Result<(), RuntimeError> {
    for dir in [
        &paths.root,
        &paths.vfs_root,
        &paths.data_dir,
        &paths.config_dir,
        &paths.tmp_dir,
    ] {
        match fs::create_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read the server-managed config file.
///
/// Missing or empty files yield the defaults (`enabled: false`, empty
/// configuration). Malformed JSON is logged and replaced by defaults —
/// this function never fails on content. Permission errors do propagate.
pub fn read_config(paths: &StoragePaths) -> Result<PluginConfigFile, RuntimeError> {
    let text = match fs::read_to_string(&paths.config_file) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PluginConfigFile::default());
        }
        Err(e) => return Err(e.into()),
    };

    if text.trim().is_empty() {
        return Ok(PluginConfigFile::default());
    }

    match serde_json::from_str(&text) {
        Ok(cfg) => Ok(cfg),
        Err(e) => {
            tracing::warn!(
                "Malformed plugin config at {}: {} — using defaults",
                paths.config_file.display(),
                e
            );
            Ok(PluginConfigFile::default())
        }
    }
}

/// Atomically persist the server-managed config file.
///
/// The value is serialized as canonical JSON to a temporary sibling, fsynced,
/// then renamed over the destination, so a crash mid-write leaves either the
/// old or the new file, never a truncated one.
pub fn write_config(paths: &StoragePaths, value: &PluginConfigFile) -> Result<(), RuntimeError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| RuntimeError::ConfigWrite(e.to_string()))?;

    let tmp = paths.config_file.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &paths.config_file)?;
    Ok(())
}

/// Delete everything under `vfs/tmp/`. Called at each plugin start and by
/// the periodic sweep. Missing entries are not errors.
pub fn cleanup_tmp(paths: &StoragePaths) -> Result<(), RuntimeError> {
    let entries = match fs::read_dir(&paths.tmp_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Total bytes stored under the plugin's root (config file included).
pub fn disk_usage(paths: &StoragePaths) -> Result<u64, RuntimeError> {
    fn walk(dir: &Path) -> std::io::Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                total += walk(&entry.path())?;
            } else {
                total += meta.len();
            }
        }
        Ok(total)
    }
    match walk(&paths.root) {
        Ok(total) => Ok(total),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Remove the plugin's entire storage subtree. Used on uninstall.
pub fn destroy(paths: &StoragePaths) -> Result<(), RuntimeError> {
    match fs::remove_dir_all(&paths.root) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn paths_in(dir: &TempDir) -> StoragePaths {
        resolve("anchor-watch", dir.path()).unwrap()
    }

    #[test]
    fn test_resolve_layout() {
        let paths = resolve("anchor-watch", Path::new("/var/pelorus")).unwrap();
        assert_eq!(
            paths.config_file,
            Path::new("/var/pelorus/plugin-config-data/anchor-watch/anchor-watch.json")
        );
        assert_eq!(
            paths.tmp_dir,
            Path::new("/var/pelorus/plugin-config-data/anchor-watch/vfs/tmp")
        );
    }

    #[test]
    fn test_hostile_plugin_ids_rejected() {
        for bad in ["", "..", "a/b", "a\\b", ".hidden", "x\0y", "ø"] {
            assert!(
                validate_plugin_id(bad).is_err(),
                "id {bad:?} should be rejected"
            );
        }
        for good in ["anchor-watch", "com.acme.nav", "ais_bridge2"] {
            assert!(validate_plugin_id(good).is_ok(), "id {good:?}");
        }
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        initialize(&paths).unwrap();
        initialize(&paths).unwrap();
        assert!(paths.data_dir.is_dir());
        assert!(paths.config_dir.is_dir());
        assert!(paths.tmp_dir.is_dir());
    }

    #[test]
    fn test_read_config_missing_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        initialize(&paths).unwrap();
        let cfg = read_config(&paths).unwrap();
        assert_eq!(cfg, PluginConfigFile::default());
    }

    #[test]
    fn test_read_config_malformed_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        initialize(&paths).unwrap();
        fs::write(&paths.config_file, b"{ not json").unwrap();
        let cfg = read_config(&paths).unwrap();
        assert_eq!(cfg, PluginConfigFile::default());
    }

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        initialize(&paths).unwrap();

        let cfg = PluginConfigFile {
            enabled: true,
            configuration: json!({"interval_ms": 1000}),
        };
        write_config(&paths, &cfg).unwrap();
        assert_eq!(read_config(&paths).unwrap(), cfg);
    }

    #[test]
    fn test_write_config_leaves_no_temp_sibling() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        initialize(&paths).unwrap();
        write_config(&paths, &PluginConfigFile::default()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(&paths.root)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_cleanup_tmp_removes_contents_only() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        initialize(&paths).unwrap();

        fs::write(paths.tmp_dir.join("scratch.bin"), b"x").unwrap();
        fs::create_dir(paths.tmp_dir.join("nested")).unwrap();
        fs::write(paths.tmp_dir.join("nested/deep.txt"), b"y").unwrap();
        fs::write(paths.data_dir.join("keep.db"), b"z").unwrap();

        cleanup_tmp(&paths).unwrap();

        assert!(paths.tmp_dir.is_dir());
        assert_eq!(fs::read_dir(&paths.tmp_dir).unwrap().count(), 0);
        assert!(paths.data_dir.join("keep.db").exists());
    }

    #[test]
    fn test_disk_usage_counts_all_files() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        initialize(&paths).unwrap();
        fs::write(paths.data_dir.join("a"), vec![0u8; 100]).unwrap();
        fs::write(paths.tmp_dir.join("b"), vec![0u8; 50]).unwrap();
        assert_eq!(disk_usage(&paths).unwrap(), 150);
    }

    #[test]
    fn test_destroy_removes_subtree() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        initialize(&paths).unwrap();
        destroy(&paths).unwrap();
        assert!(!paths.root.exists());
        // Destroying again is a no-op.
        destroy(&paths).unwrap();
    }
}
