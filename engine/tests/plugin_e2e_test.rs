//! End-to-end plugin scenarios
//!
//! These tests drive a real guest module through the full runtime:
//! registration, auto-start, config edits under load, crash recovery, and
//! capability denial. They need `plugins/anchor-watch` compiled for
//! `wasm32-wasip1` and are ignored in default runs:
//!
//! ```text
//! cargo build -p anchor-watch --target wasm32-wasip1 --release
//! PELORUS_FIXTURE_WASM=target/wasm32-wasip1/release/anchor_watch.wasm \
//!     cargo test -p engine -- --ignored
//! ```

use pelorus_engine::config::Settings;
use pelorus_engine::host::LocalHostServices;
use pelorus_engine::registry::Registry;
use sdk::manifest::{Capabilities, PluginManifest};
use sdk::types::{Delta, PathValue, PluginConfigFile, PluginStatus};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn fixture_module() -> PathBuf {
    PathBuf::from(
        std::env::var("PELORUS_FIXTURE_WASM")
            .expect("set PELORUS_FIXTURE_WASM to the compiled anchor-watch module"),
    )
}

fn fixture_manifest(capabilities: Capabilities) -> PluginManifest {
    PluginManifest {
        package_name: "@pelorus/anchor-watch".into(),
        manifest_version: "1".into(),
        plugin_version: "0.1.0".into(),
        module_path: fixture_module(),
        capabilities,
        keywords: vec!["wasm-plugin".into()],
    }
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.lifecycle.backoff_initial_ms = 100;
    settings.lifecycle.backoff_cap_ms = 1_000;
    settings.lifecycle.grace_period_ms = 60_000;
    settings
}

async fn wait_for_status(registry: &Arc<Registry>, id: &str, wanted: PluginStatus) {
    for _ in 0..100 {
        if registry.summary(id).map(|s| s.status) == Some(wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "plugin '{id}' never reached {wanted:?}; now {:?}",
        registry.summary(id).map(|s| s.status)
    );
}

#[tokio::test]
#[ignore] // Requires a compiled anchor-watch fixture module
async fn test_register_and_auto_start() {
    let root = TempDir::new().unwrap();
    let host = Arc::new(LocalHostServices::new(root.path()));
    let registry = Registry::new(host, fast_settings());

    registry
        .register(fixture_manifest(Capabilities::default()))
        .await
        .unwrap();

    // Persisted config defaults to disabled; enable it.
    registry
        .apply_config_update(
            "anchor-watch",
            Some(true),
            Some(json!({"radius_m": 30.0})),
        )
        .await
        .unwrap();
    wait_for_status(&registry, "anchor-watch", PluginStatus::Running).await;

    // The config file exists with the persisted contents, beside the vfs.
    let config_path = root
        .path()
        .join("plugin-config-data/anchor-watch/anchor-watch.json");
    let on_disk: PluginConfigFile =
        serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
    assert!(on_disk.enabled);
    assert_eq!(on_disk.configuration, json!({"radius_m": 30.0}));
    assert!(root
        .path()
        .join("plugin-config-data/anchor-watch/vfs/tmp")
        .is_dir());

    registry.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires a compiled anchor-watch fixture module
async fn test_config_edit_under_load_restarts_and_preserves_subscriptions() {
    let root = TempDir::new().unwrap();
    let host = Arc::new(LocalHostServices::new(root.path()));
    let bus = host.bus_sender();
    let registry = Registry::new(host, fast_settings());

    registry
        .register(fixture_manifest(Capabilities::default()))
        .await
        .unwrap();
    registry.set_enabled("anchor-watch", true).await.unwrap();
    wait_for_status(&registry, "anchor-watch", PluginStatus::Running).await;
    assert_eq!(
        registry.subscriptions().subscription_count("anchor-watch").await,
        1
    );

    registry
        .update_configuration("anchor-watch", json!({"radius_m": 10.0}))
        .await
        .unwrap();
    wait_for_status(&registry, "anchor-watch", PluginStatus::Running).await;

    // Subscription intent survived the restart; a published position still
    // reaches the new instance.
    assert_eq!(
        registry.subscriptions().subscription_count("anchor-watch").await,
        1
    );
    bus.send(Delta {
        context: "vessels.self".into(),
        source: None,
        timestamp: None,
        values: vec![PathValue {
            path: "navigation.position".into(),
            value: json!({"latitude": 60.0, "longitude": 5.0}),
        }],
    })
    .unwrap();

    registry.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires a fixture module whose start succeeds and then traps
async fn test_crash_recovery_backs_off_then_disables() {
    // Expected sequence once a crashing fixture is wired in:
    //   Running → Crashed → Starting → Running (backoff 100 ms, then 200 ms)
    // and after the third trap the record lands in Error with
    // "repeatedly crashing, automatic restart disabled" and no timer pending.
    let root = TempDir::new().unwrap();
    let host = Arc::new(LocalHostServices::new(root.path()));
    let registry = Registry::new(host, fast_settings());

    registry
        .register(fixture_manifest(Capabilities::default()))
        .await
        .unwrap();
    registry.set_enabled("anchor-watch", true).await.unwrap();
    wait_for_status(&registry, "anchor-watch", PluginStatus::Running).await;

    for expected_count in 1..=2 {
        registry
            .observe_fault(
                "anchor-watch",
                sdk::errors::RuntimeError::Crash("guest trap".into()),
            )
            .await;
        let summary = registry.summary("anchor-watch").unwrap();
        assert_eq!(summary.crash_count, expected_count);
        assert!(summary.last_crash_at.is_some());
        wait_for_status(&registry, "anchor-watch", PluginStatus::Running).await;
    }

    registry
        .observe_fault(
            "anchor-watch",
            sdk::errors::RuntimeError::Crash("guest trap".into()),
        )
        .await;
    let summary = registry.summary("anchor-watch").unwrap();
    assert_eq!(summary.status, PluginStatus::Error);
    assert_eq!(
        summary.error_message.as_deref(),
        Some("repeatedly crashing, automatic restart disabled")
    );

    // Manual reload clears the counter and brings it back.
    registry.reload("anchor-watch").await.unwrap();
    wait_for_status(&registry, "anchor-watch", PluginStatus::Running).await;
    assert_eq!(registry.summary("anchor-watch").unwrap().crash_count, 0);

    registry.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires a fixture module that calls http_fetch without the capability
async fn test_capability_denial_returns_error_code() {
    // The fixture declares no `network` capability and calls `http_fetch`
    // from start(): the guest must observe a permission_denied envelope, the
    // host must log the denial once, and no outbound socket is created.
    let root = TempDir::new().unwrap();
    let host = Arc::new(LocalHostServices::new(root.path()));
    let registry = Registry::new(host, fast_settings());

    let capabilities = Capabilities {
        network: false,
        ..Capabilities::default()
    };
    registry
        .register(fixture_manifest(capabilities))
        .await
        .unwrap();
    registry.set_enabled("anchor-watch", true).await.unwrap();
    wait_for_status(&registry, "anchor-watch", PluginStatus::Running).await;

    registry.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires a fixture module that opens "../../etc/passwd" from start()
async fn test_vfs_isolation_blocks_escaping_paths() {
    // With storage=vfs_only the guest's preopen is its vfs/ directory; an
    // open of "../../etc/passwd" must fail inside the guest and no host-side
    // read may occur. The fixture reports the open result through its
    // status message.
    let root = TempDir::new().unwrap();
    let host = Arc::new(LocalHostServices::new(root.path()));
    let registry = Registry::new(host, fast_settings());

    registry
        .register(fixture_manifest(Capabilities::default()))
        .await
        .unwrap();
    registry.set_enabled("anchor-watch", true).await.unwrap();
    wait_for_status(&registry, "anchor-watch", PluginStatus::Running).await;

    registry.shutdown().await;
}
