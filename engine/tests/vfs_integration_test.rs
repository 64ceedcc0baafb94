//! Integration tests for per-plugin storage
//!
//! These tests exercise the storage layout, atomic config persistence, and
//! the tmp-sweep behavior against a real (temporary) filesystem.

use pelorus_engine::vfs;
use sdk::errors::RuntimeError;
use sdk::types::PluginConfigFile;
use serde_json::json;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_full_layout_lifecycle() {
    let root = TempDir::new().unwrap();
    let paths = vfs::resolve("anchor-watch", root.path()).unwrap();
    vfs::initialize(&paths).unwrap();

    // Layout matches the documented shape.
    assert!(paths
        .root
        .ends_with("plugin-config-data/anchor-watch"));
    assert!(paths.vfs_root.is_dir());
    assert!(paths.data_dir.is_dir());
    assert!(paths.config_dir.is_dir());
    assert!(paths.tmp_dir.is_dir());

    // The config file lives beside the vfs root, outside the sandbox.
    assert_eq!(paths.config_file.parent().unwrap(), paths.root);
    assert!(!paths.config_file.starts_with(&paths.vfs_root));

    vfs::destroy(&paths).unwrap();
    assert!(!paths.root.exists());
}

#[test]
fn test_config_write_then_read_round_trips() {
    let root = TempDir::new().unwrap();
    let paths = vfs::resolve("anchor-watch", root.path()).unwrap();
    vfs::initialize(&paths).unwrap();

    let config = PluginConfigFile {
        enabled: true,
        configuration: json!({
            "interval_ms": 1000,
            "zones": [{"name": "harbor", "radius_m": 25.0}],
            "note": "påhengsmotor"
        }),
    };
    vfs::write_config(&paths, &config).unwrap();
    assert_eq!(vfs::read_config(&paths).unwrap(), config);

    // Overwrite with different content; the newest write wins.
    let updated = PluginConfigFile {
        enabled: false,
        configuration: json!({"interval_ms": 250}),
    };
    vfs::write_config(&paths, &updated).unwrap();
    assert_eq!(vfs::read_config(&paths).unwrap(), updated);
}

#[test]
fn test_written_file_is_always_complete_json() {
    // Atomicity surface: after any number of writes, the on-disk file parses
    // as complete JSON — no observer ever sees a truncated document.
    let root = TempDir::new().unwrap();
    let paths = vfs::resolve("anchor-watch", root.path()).unwrap();
    vfs::initialize(&paths).unwrap();

    for i in 0..50 {
        let config = PluginConfigFile {
            enabled: i % 2 == 0,
            configuration: json!({ "i": i, "payload": "x".repeat(i * 37) }),
        };
        vfs::write_config(&paths, &config).unwrap();
        let on_disk = fs::read_to_string(&paths.config_file).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&on_disk)
            .unwrap_or_else(|e| panic!("truncated config after write #{i}: {e}"));
        assert_eq!(parsed["configuration"]["i"], json!(i));
    }
}

#[test]
fn test_malformed_config_is_replaced_on_next_write() {
    let root = TempDir::new().unwrap();
    let paths = vfs::resolve("anchor-watch", root.path()).unwrap();
    vfs::initialize(&paths).unwrap();

    fs::write(&paths.config_file, "{ \"enabled\": tru").unwrap();

    // Reads fall back to defaults rather than failing.
    let config = vfs::read_config(&paths).unwrap();
    assert_eq!(config, PluginConfigFile::default());

    // The next write replaces the malformed file with valid JSON.
    vfs::write_config(&paths, &config).unwrap();
    let on_disk: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&paths.config_file).unwrap()).unwrap();
    assert_eq!(on_disk["enabled"], json!(false));
}

#[test]
fn test_hostile_ids_cannot_escape_the_storage_root() {
    let root = TempDir::new().unwrap();
    for bad in ["../escape", "a/b", "..", ".ssh", ""] {
        let err = vfs::resolve(bad, root.path()).unwrap_err();
        assert!(
            matches!(err, RuntimeError::InvalidPluginId(_)),
            "id {bad:?} produced {err:?}"
        );
    }
}

#[test]
fn test_disk_usage_and_tmp_cleanup() {
    let root = TempDir::new().unwrap();
    let paths = vfs::resolve("anchor-watch", root.path()).unwrap();
    vfs::initialize(&paths).unwrap();

    fs::write(paths.data_dir.join("track.db"), vec![0u8; 2048]).unwrap();
    fs::create_dir_all(paths.tmp_dir.join("scratch")).unwrap();
    fs::write(paths.tmp_dir.join("scratch/partial.dat"), vec![0u8; 512]).unwrap();

    let before = vfs::disk_usage(&paths).unwrap();
    assert!(before >= 2560);

    vfs::cleanup_tmp(&paths).unwrap();
    assert!(paths.tmp_dir.is_dir());
    assert_eq!(fs::read_dir(&paths.tmp_dir).unwrap().count(), 0);
    assert!(paths.data_dir.join("track.db").exists());

    let after = vfs::disk_usage(&paths).unwrap();
    assert!(after < before);
}
