//! WASM module runtime
//!
//! Loads guest modules via Extism against a WASI-style sandbox and owns the
//! [`PluginInstance`] handle for each live instance.
//!
//! # Load protocol
//!
//! 1. Read the bytes at the manifest's `module_path`.
//! 2. Sniff the header: only core WebAssembly modules are accepted;
//!    component-model binaries are rejected before they reach the engine.
//! 3. Build the sandbox: guest-visible configuration limited to `PLUGIN_ID`,
//!    pre-opened roots limited to the plugin's `vfs/` (mounted as `/`) when
//!    storage is granted, no allowed hosts, a per-call time budget.
//! 4. Instantiate with the host-call table from the capability gate.
//! 5. Verify the required exports (`id`, `name`, `schema`, `start`, `stop`)
//!    and resolve the plugin identity. A missing export fails the load and
//!    drops the partially created instance.
//!
//! Compile and instantiate failures surface as `Load` errors and never touch
//! the crash counter; crashes are post-start faults by definition.
//!
//! # Concurrency
//!
//! An instance is driven by one guest call at a time: the Extism plugin sits
//! behind a mutex and every call goes through `spawn_blocking`, so host
//! threads never enter the same instance concurrently. Calls are bounded;
//! on overrun the in-flight call is cancelled through Extism's cancel
//! handle and the caller sees a `Timeout`.

use extism::{Manifest as ExtismManifest, Plugin, PluginBuilder, UserData, Wasm};
use sdk::errors::RuntimeError;
use sdk::manifest::{PluginManifest, StorageMode};
use sdk::types::HttpEndpointDecl;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bridge::{create_host_functions, BridgeState};
use crate::capabilities::CapabilityGrant;
use crate::config::LifecycleSettings;
use crate::subscriptions::{DeltaEnvelope, DeltaSink};
use crate::vfs::StoragePaths;

/// Exports every plugin module must provide.
const REQUIRED_EXPORTS: [&str; 5] = ["id", "name", "schema", "start", "stop"];

/// Identity resolved from a loaded module.
#[derive(Debug, Clone)]
pub struct PluginIdentity {
    /// Stable plugin id; the registry key.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Configuration schema the plugin advertises.
    pub schema: Value,
}

/// Outcome of a bounded guest call, before the caller assigns meaning.
enum CallFailure {
    /// The guest returned an error or trapped.
    Guest(String),
    /// The call overran its budget and was cancelled.
    Timeout,
}

/// A live, sandboxed plugin instance.
///
/// The Extism plugin value owns the module, instance, and memory handles;
/// dropping the instance releases them in that order.
pub struct PluginInstance {
    pub identity: PluginIdentity,
    pub manifest: PluginManifest,
    pub storage: StoragePaths,
    pub grant: CapabilityGrant,
    /// Routes declared by the guest's `http_endpoints` export, already
    /// filtered by the `http_endpoints` capability.
    pub endpoints: Vec<HttpEndpointDecl>,
    plugin: Arc<Mutex<Plugin>>,
    call_budget: Duration,
}

impl PluginInstance {
    /// Call the guest's `start` with its configuration JSON.
    ///
    /// A non-zero return or trap surfaces as [`RuntimeError::Start`]; an
    /// overrun of `budget` as [`RuntimeError::Timeout`].
    pub async fn call_start(&self, configuration: &Value, budget: Duration) -> Result<(), RuntimeError> {
        let input = serde_json::to_vec(configuration)
            .map_err(|e| RuntimeError::Config(e.to_string()))?;
        match self.call_bytes("start", input, budget).await {
            Ok(_) => Ok(()),
            Err(CallFailure::Guest(message)) => Err(RuntimeError::Start { code: 1, message }),
            Err(CallFailure::Timeout) => {
                Err(RuntimeError::Timeout(format!("start() of '{}'", self.identity.id)))
            }
        }
    }

    /// Call the guest's `stop`. Best effort: a non-zero return is logged by
    /// the caller, not escalated.
    pub async fn call_stop(&self, budget: Duration) -> Result<(), RuntimeError> {
        match self.call_bytes("stop", Vec::new(), budget).await {
            Ok(_) => Ok(()),
            Err(CallFailure::Guest(message)) => Err(RuntimeError::Crash(message)),
            Err(CallFailure::Timeout) => {
                Err(RuntimeError::Timeout(format!("stop() of '{}'", self.identity.id)))
            }
        }
    }

    /// Call an arbitrary guest export with a JSON payload. Used for guest
    /// HTTP handlers and PUT dispatch.
    pub async fn call_json(
        &self,
        export: &str,
        input: Vec<u8>,
        budget: Duration,
    ) -> Result<Vec<u8>, RuntimeError> {
        match self.call_bytes(export, input, budget).await {
            Ok(bytes) => Ok(bytes),
            Err(CallFailure::Guest(message)) => Err(RuntimeError::Crash(message)),
            Err(CallFailure::Timeout) => {
                Err(RuntimeError::Timeout(format!("{export}() of '{}'", self.identity.id)))
            }
        }
    }

    /// Whether the module exports a function.
    pub fn has_export(&self, name: &str) -> bool {
        self.plugin.lock().unwrap().function_exists(name)
    }

    /// Delta sink delivering into the guest's `on_delta` export.
    pub fn delta_sink(self: &Arc<Self>) -> Arc<dyn DeltaSink> {
        Arc::new(GuestDeltaSink {
            instance: Arc::clone(self),
        })
    }

    async fn call_bytes(
        &self,
        export: &str,
        input: Vec<u8>,
        budget: Duration,
    ) -> Result<Vec<u8>, CallFailure> {
        let plugin = Arc::clone(&self.plugin);
        let cancel = plugin.lock().unwrap().cancel_handle();
        let export_name = export.to_string();

        let call = tokio::task::spawn_blocking(move || {
            let mut guard = plugin.lock().unwrap();
            guard
                .call::<&[u8], Vec<u8>>(&export_name, &input)
                .map_err(|e| e.to_string())
        });

        match tokio::time::timeout(budget, call).await {
            Ok(Ok(Ok(bytes))) => Ok(bytes),
            Ok(Ok(Err(message))) => Err(CallFailure::Guest(message)),
            Ok(Err(join_error)) => Err(CallFailure::Guest(format!(
                "guest call aborted: {join_error}"
            ))),
            Err(_) => {
                let _ = cancel.cancel();
                Err(CallFailure::Timeout)
            }
        }
    }
}

/// [`DeltaSink`] that hands envelopes to the guest's `on_delta` export.
struct GuestDeltaSink {
    instance: Arc<PluginInstance>,
}

#[async_trait::async_trait]
impl DeltaSink for GuestDeltaSink {
    async fn deliver(&self, envelope: &DeltaEnvelope) -> Result<(), RuntimeError> {
        let input =
            serde_json::to_vec(envelope).map_err(|e| RuntimeError::InvalidInput(e.to_string()))?;
        self.instance
            .call_json("on_delta", input, self.instance.call_budget)
            .await
            .map(|_| ())
    }
}

/// Loads and tears down guest modules.
pub struct ModuleRuntime {
    lifecycle: LifecycleSettings,
}

impl ModuleRuntime {
    pub fn new(lifecycle: LifecycleSettings) -> Self {
        Self { lifecycle }
    }

    /// Transient load to resolve a module's identity during registration.
    ///
    /// The probe instance gets stub host functions, no filesystem, and no
    /// configuration; only `id`, `name`, and `schema` are called before the
    /// instance is dropped.
    pub async fn probe(&self, manifest: &PluginManifest) -> Result<PluginIdentity, RuntimeError> {
        let bytes = read_module(manifest)?;
        let package_name = manifest.package_name.clone();
        tokio::task::spawn_blocking(move || {
            let extism_manifest = ExtismManifest::new([Wasm::data(bytes)]);
            let mut plugin = PluginBuilder::new(extism_manifest)
                .with_wasi(true)
                .with_functions(probe_stub_functions())
                .build()
                .map_err(|e| {
                    RuntimeError::Load(format!("failed to instantiate '{package_name}': {e}"))
                })?;
            require_exports(&mut plugin)?;
            resolve_identity(&mut plugin)
        })
        .await
        .map_err(|e| RuntimeError::Load(format!("probe task aborted: {e}")))?
    }

    /// Load a module into a live instance against its storage and grant.
    ///
    /// `bridge_state` carries the host-call wiring for this instance; its
    /// plugin id must match the identity the module reports.
    pub async fn load(
        &self,
        manifest: &PluginManifest,
        storage: &StoragePaths,
        grant: &CapabilityGrant,
        bridge_state: BridgeState,
    ) -> Result<Arc<PluginInstance>, RuntimeError> {
        let bytes = read_module(manifest)?;
        let expected_id = bridge_state.plugin_id.clone();
        let call_budget = Duration::from_millis(self.lifecycle.start_timeout_ms);

        let mut extism_manifest = ExtismManifest::new([Wasm::data(bytes)])
            .with_config_key("PLUGIN_ID", expected_id.clone())
            .with_timeout(call_budget);
        if grant.storage() == StorageMode::VfsOnly {
            extism_manifest = extism_manifest
                .with_allowed_path(storage.vfs_root.display().to_string(), "/".to_string());
        }

        let user_data = UserData::new(bridge_state);
        let functions = create_host_functions(&user_data, grant);
        let package_name = manifest.package_name.clone();
        let wants_endpoints = grant.http_endpoints();

        let (plugin, identity, endpoints) = tokio::task::spawn_blocking(move || {
            let mut plugin = PluginBuilder::new(extism_manifest)
                .with_wasi(true)
                .with_functions(functions)
                .build()
                .map_err(|e| {
                    RuntimeError::Load(format!("failed to instantiate '{package_name}': {e}"))
                })?;

            require_exports(&mut plugin)?;
            let identity = resolve_identity(&mut plugin)?;
            if identity.id != expected_id {
                return Err(RuntimeError::Load(format!(
                    "module reports id '{}', expected '{}'",
                    identity.id, expected_id
                )));
            }

            // Record whether deltas can be delivered before any subscribe.
            if let Ok(state) = user_data.get() {
                state.lock().unwrap().has_on_delta = plugin.function_exists("on_delta");
            }

            let endpoints = if wants_endpoints && plugin.function_exists("http_endpoints") {
                read_endpoints(&mut plugin, &identity.id)
            } else {
                Vec::new()
            };

            Ok::<_, RuntimeError>((plugin, identity, endpoints))
        })
        .await
        .map_err(|e| RuntimeError::Load(format!("load task aborted: {e}")))??;

        Ok(Arc::new(PluginInstance {
            identity,
            manifest: manifest.clone(),
            storage: storage.clone(),
            grant: grant.clone(),
            endpoints,
            plugin: Arc::new(Mutex::new(plugin)),
            call_budget,
        }))
    }

    /// Tear an instance down: best-effort `stop`, then release the handles.
    ///
    /// Always returns; a failing or overrunning `stop` is logged and the
    /// handles are released regardless.
    pub async fn unload(&self, instance: &PluginInstance) {
        let budget = Duration::from_millis(self.lifecycle.stop_timeout_ms);
        if let Err(e) = instance.call_stop(budget).await {
            tracing::warn!(
                "stop() of plugin '{}' failed during unload: {}",
                instance.identity.id,
                e
            );
        }
        // Dropping the last Arc releases instance, memory, and module.
    }
}

/// Read and sanity-check module bytes.
fn read_module(manifest: &PluginManifest) -> Result<Vec<u8>, RuntimeError> {
    let bytes = std::fs::read(&manifest.module_path).map_err(|e| {
        RuntimeError::Load(format!(
            "failed to read module '{}': {e}",
            manifest.module_path.display()
        ))
    })?;
    sniff_module(&bytes)?;
    Ok(bytes)
}

/// Accept core WebAssembly modules only.
///
/// The header is `\0asm` followed by a little-endian version. Core modules
/// carry version 1 (bytes 6 and 7 zero); component-model binaries encode a
/// non-zero layer there and are rejected — there is no component support.
fn sniff_module(bytes: &[u8]) -> Result<(), RuntimeError> {
    if bytes.len() < 8 || &bytes[0..4] != b"\0asm" {
        return Err(RuntimeError::Load("not a WebAssembly module".into()));
    }
    if bytes[6] != 0 || bytes[7] != 0 {
        return Err(RuntimeError::Load(
            "component-model binaries are not supported; ship a core wasm module".into(),
        ));
    }
    Ok(())
}

fn require_exports(plugin: &mut Plugin) -> Result<(), RuntimeError> {
    for export in REQUIRED_EXPORTS {
        if !plugin.function_exists(export) {
            return Err(RuntimeError::MissingExport(export.to_string()));
        }
    }
    Ok(())
}

fn resolve_identity(plugin: &mut Plugin) -> Result<PluginIdentity, RuntimeError> {
    let id = call_string(plugin, "id")?;
    crate::vfs::validate_plugin_id(&id)?;
    let name = call_string(plugin, "name")?;
    let schema_bytes = plugin
        .call::<&[u8], Vec<u8>>("schema", &[] as &[u8])
        .map_err(|e| RuntimeError::Load(format!("schema() failed: {e}")))?;
    let schema = if schema_bytes.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(&schema_bytes)
            .map_err(|e| RuntimeError::Load(format!("schema() returned invalid JSON: {e}")))?
    };
    Ok(PluginIdentity { id, name, schema })
}

fn call_string(plugin: &mut Plugin, export: &str) -> Result<String, RuntimeError> {
    let value = plugin
        .call::<&[u8], String>(export, &[] as &[u8])
        .map_err(|e| RuntimeError::Load(format!("{export}() failed: {e}")))?;
    if value.is_empty() {
        return Err(RuntimeError::Load(format!("{export}() returned nothing")));
    }
    Ok(value)
}

fn read_endpoints(plugin: &mut Plugin, plugin_id: &str) -> Vec<HttpEndpointDecl> {
    match plugin.call::<&[u8], Vec<u8>>("http_endpoints", &[] as &[u8]) {
        Ok(bytes) => match serde_json::from_slice::<Vec<HttpEndpointDecl>>(&bytes) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!(
                    "Plugin '{}' declared malformed http_endpoints: {} — ignoring",
                    plugin_id,
                    e
                );
                Vec::new()
            }
        },
        Err(e) => {
            tracing::warn!(
                "Plugin '{}' http_endpoints() failed: {} — ignoring",
                plugin_id,
                e
            );
            Vec::new()
        }
    }
}

/// Stub host functions for the identity probe. Every known call is present
/// so any module links, and every call reports that the runtime is not
/// available during load.
fn probe_stub_functions() -> Vec<extism::Function> {
    use extism::{CurrentPlugin, Val, ValType};
    use sdk::types::{HostCallError, HostErrorCode, HostResult};

    crate::capabilities::HostCall::ALL
        .iter()
        .map(|call| {
            extism::Function::new(
                call.name(),
                [ValType::I64],
                [ValType::I64],
                UserData::new(()),
                |plugin: &mut CurrentPlugin,
                 _inputs: &[Val],
                 outputs: &mut [Val],
                 _user_data: UserData<()>|
                 -> Result<(), extism::Error> {
                    let result: HostResult<()> = HostResult::Err(HostCallError::new(
                        HostErrorCode::NotRunning,
                        "host calls are unavailable during load",
                    ));
                    let bytes = serde_json::to_vec(&result)
                        .map_err(|e| extism::Error::msg(e.to_string()))?;
                    let handle = plugin.memory_new(&bytes)?;
                    outputs[0] = plugin.memory_to_val(handle);
                    Ok(())
                },
            )
        })
        .collect()
}
