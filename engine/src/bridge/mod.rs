//! ServerAPI bridge
//!
//! Host-side implementations of the calls a guest may import. Each call
//! reads a JSON request from guest linear memory, validates it on the host
//! side, performs the effect, and writes a JSON result envelope back
//! (`{"ok": ...}` or `{"err": {"code", "message"}}`). The bridge never
//! throws into a guest: every failure — validation, permission, I/O,
//! timeout — comes back as an error envelope.
//!
//! # Capability enforcement
//!
//! The instance's [`CapabilityGrant`] decides which calls get their real
//! implementation. Ungranted calls are still registered so the module links,
//! but as stubs that return `permission_denied`; the denial is logged once
//! per plugin per capability and has no side effects.
//!
//! # Threading
//!
//! Guest calls run on blocking threads (`spawn_blocking`), so host functions
//! are synchronous closures that bridge to async host services with
//! `Handle::block_on`. State shared with the callbacks travels through
//! Extism's `UserData`, which serializes access per instance.

use extism::{CurrentPlugin, UserData, Val, ValType};
use sdk::errors::RuntimeError;
use sdk::types::{
    Delta, FetchRequest, FetchResponse, HostCallError, HostErrorCode, HostResult, LogRequest,
    PutHandlerRequest, ResourceProviderRequest, SerialPortInfo, SetStatusRequest,
    SubscribeRequest, SubscribeResponse, UnsubscribeRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::capabilities::{CapabilityGrant, HostCall};
use crate::config::BridgeSettings;
use crate::host::HostServices;
use crate::subscriptions::SubscriptionManager;

/// Registry-side operations the bridge needs for config and status calls.
///
/// Implemented by the plugin registry. All methods are synchronous and must
/// not block on the registry's per-record operation lock: a guest may call
/// `write_config` from inside its own `start`, and the restart that a config
/// write triggers is therefore deferred to a spawned task that queues behind
/// the in-flight lifecycle operation.
pub trait RecordHooks: Send + Sync {
    /// Current in-memory configuration of the plugin.
    fn read_configuration(&self, plugin_id: &str) -> serde_json::Value;

    /// Persist a new configuration and schedule the stop→start that
    /// surfaces it to the guest. In-memory state is rolled back if
    /// persistence fails.
    fn write_configuration(
        &self,
        plugin_id: &str,
        configuration: serde_json::Value,
    ) -> Result<(), RuntimeError>;

    /// Current lifecycle status, if the plugin is registered.
    fn record_status(&self, plugin_id: &str) -> Option<sdk::types::PluginStatus>;

    /// Free-text status surfaced through the HTTP façade.
    fn set_status_message(&self, plugin_id: &str, message: String);
}

/// Cross-plugin registration tables (PUT handlers, resource providers).
#[derive(Default)]
pub struct Tables {
    put_handlers: Mutex<HashMap<(String, String), String>>,
    resource_providers: Mutex<HashMap<String, String>>,
}

impl Tables {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind a PUT handler. Only one handler per `(path, source)` tuple; a
    /// plugin may re-register its own binding.
    pub fn register_put_handler(
        &self,
        plugin_id: &str,
        path: &str,
        source: &str,
    ) -> Result<(), HostCallError> {
        let key = (path.to_string(), source.to_string());
        let mut handlers = self.put_handlers.lock().unwrap();
        if handlers.get(&key).is_some_and(|owner| owner != plugin_id) {
            return Err(HostCallError::invalid_input(format!(
                "a PUT handler for ({path}, {source}) is already registered"
            )));
        }
        handlers.insert(key, plugin_id.to_string());
        Ok(())
    }

    /// Mark a plugin authoritative for a resource type.
    pub fn register_resource_provider(
        &self,
        plugin_id: &str,
        resource_type: &str,
    ) -> Result<(), HostCallError> {
        let mut providers = self.resource_providers.lock().unwrap();
        if providers
            .get(resource_type)
            .is_some_and(|owner| owner != plugin_id)
        {
            return Err(HostCallError::invalid_input(format!(
                "resource type '{resource_type}' already has a provider"
            )));
        }
        providers.insert(resource_type.to_string(), plugin_id.to_string());
        Ok(())
    }

    /// Drop every registration owned by a plugin. Called on unload.
    pub fn remove_plugin(&self, plugin_id: &str) {
        self.put_handlers
            .lock()
            .unwrap()
            .retain(|_, owner| owner != plugin_id);
        self.resource_providers
            .lock()
            .unwrap()
            .retain(|_, owner| owner != plugin_id);
    }

    /// Owner of a PUT handler, if bound.
    pub fn put_handler_owner(&self, path: &str, source: &str) -> Option<String> {
        self.put_handlers
            .lock()
            .unwrap()
            .get(&(path.to_string(), source.to_string()))
            .cloned()
    }
}

/// Shared state threaded through every host function of one instance.
pub struct BridgeState {
    pub plugin_id: String,
    pub grant: CapabilityGrant,
    pub host: Arc<dyn HostServices>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub hooks: Arc<dyn RecordHooks>,
    pub tables: Arc<Tables>,
    pub handle: tokio::runtime::Handle,
    pub settings: BridgeSettings,
    /// Whether the module exports `on_delta`; filled in after instantiation.
    pub has_on_delta: bool,
    /// Capabilities whose denial has already been logged for this plugin.
    denied_logged: HashSet<&'static str>,
}

impl BridgeState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugin_id: String,
        grant: CapabilityGrant,
        host: Arc<dyn HostServices>,
        subscriptions: Arc<SubscriptionManager>,
        hooks: Arc<dyn RecordHooks>,
        tables: Arc<Tables>,
        handle: tokio::runtime::Handle,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            plugin_id,
            grant,
            host,
            subscriptions,
            hooks,
            tables,
            handle,
            settings,
            has_on_delta: false,
            denied_logged: HashSet::new(),
        }
    }

    fn note_denied(&mut self, capability: &'static str) {
        if self.denied_logged.insert(capability) {
            tracing::warn!(
                "Plugin '{}' called a host function gated by capability '{}' it does not hold",
                self.plugin_id,
                capability
            );
        }
    }
}

/// Validate a dotted telemetry name: non-empty segments, no wildcards.
fn validate_dotted(name: &str, what: &str) -> Result<(), HostCallError> {
    if name.is_empty() || name.split('.').any(|s| s.is_empty() || s == "*") {
        return Err(HostCallError::invalid_input(format!(
            "invalid {what} '{name}'"
        )));
    }
    Ok(())
}

/// Truncate a guest-supplied string to `max` bytes on a char boundary.
fn bound_text(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ============================================================================
// Host function plumbing
// ============================================================================

type HostFnResult = Result<(), extism::Error>;

/// Read the JSON request, run the handler, write the result envelope.
fn host_call<Req, Resp>(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
    handler: impl FnOnce(&mut BridgeState, Req) -> Result<Resp, HostCallError>,
) -> HostFnResult
where
    Req: DeserializeOwned,
    Resp: Serialize,
{
    let state_arc = user_data.get()?;
    let mut state = state_arc.lock().unwrap();

    let input_bytes: Vec<u8> = plugin.memory_get_val(&inputs[0])?;
    let result: HostResult<Resp> = match serde_json::from_slice::<Req>(&input_bytes) {
        Ok(request) => handler(&mut state, request).into(),
        Err(e) => HostResult::Err(HostCallError::invalid_input(format!(
            "malformed request: {e}"
        ))),
    };

    write_result(plugin, outputs, &result)
}

/// Variant for calls that ignore their input.
fn host_call_no_input<Resp>(
    plugin: &mut CurrentPlugin,
    _inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
    handler: impl FnOnce(&mut BridgeState) -> Result<Resp, HostCallError>,
) -> HostFnResult
where
    Resp: Serialize,
{
    let state_arc = user_data.get()?;
    let mut state = state_arc.lock().unwrap();
    let result: HostResult<Resp> = handler(&mut state).into();
    write_result(plugin, outputs, &result)
}

fn write_result<Resp: Serialize>(
    plugin: &mut CurrentPlugin,
    outputs: &mut [Val],
    result: &HostResult<Resp>,
) -> HostFnResult {
    let bytes = serde_json::to_vec(result)
        .map_err(|e| extism::Error::msg(format!("serialize response: {e}")))?;
    let handle = plugin.memory_new(&bytes)?;
    outputs[0] = plugin.memory_to_val(handle);
    Ok(())
}

// ============================================================================
// Host function implementations
// ============================================================================

fn host_log(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call(plugin, inputs, outputs, user_data, |state, req: LogRequest| {
        let message = bound_text(&req.message, state.settings.max_log_bytes);
        state.host.log(&req.level, &state.plugin_id, message);
        Ok(())
    })
}

fn host_set_status(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call(
        plugin,
        inputs,
        outputs,
        user_data,
        |state, req: SetStatusRequest| {
            let message = bound_text(&req.message, state.settings.max_log_bytes).to_string();
            state.hooks.set_status_message(&state.plugin_id, message);
            Ok(())
        },
    )
}

fn host_read_config(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call_no_input(plugin, inputs, outputs, user_data, |state| {
        Ok(state.hooks.read_configuration(&state.plugin_id))
    })
}

fn host_write_config(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call(
        plugin,
        inputs,
        outputs,
        user_data,
        |state, configuration: serde_json::Value| {
            state
                .hooks
                .write_configuration(&state.plugin_id, configuration)
                .map_err(|e| HostCallError::new(HostErrorCode::Internal, e.to_string()))
        },
    )
}

fn host_subscribe(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call(
        plugin,
        inputs,
        outputs,
        user_data,
        |state, req: SubscribeRequest| {
            if !state.has_on_delta {
                return Err(HostCallError::invalid_input(
                    "module does not export 'on_delta'",
                ));
            }
            let subs = state.subscriptions.clone();
            let plugin_id = state.plugin_id.clone();
            let id = state
                .handle
                .block_on(async move { subs.subscribe(&plugin_id, &req.pattern).await })
                .map_err(|e| HostCallError::invalid_input(e.to_string()))?;
            Ok(SubscribeResponse {
                subscription_id: id,
            })
        },
    )
}

fn host_unsubscribe(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call(
        plugin,
        inputs,
        outputs,
        user_data,
        |state, req: UnsubscribeRequest| {
            let subs = state.subscriptions.clone();
            let plugin_id = state.plugin_id.clone();
            state.handle.block_on(async move {
                subs.unsubscribe(&plugin_id, &req.subscription_id).await;
            });
            Ok(())
        },
    )
}

fn host_publish_delta(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call(plugin, inputs, outputs, user_data, |state, mut delta: Delta| {
        validate_dotted(&delta.context, "context")?;
        for pv in &delta.values {
            validate_dotted(&pv.path, "path")?;
        }
        if delta.values.is_empty() {
            return Err(HostCallError::invalid_input("delta has no values"));
        }

        // Refuse publishes from instances on their way down.
        use sdk::types::PluginStatus::*;
        match state.hooks.record_status(&state.plugin_id) {
            Some(Running) | Some(Starting) => {}
            _ => {
                return Err(HostCallError::new(
                    HostErrorCode::NotRunning,
                    "plugin is not running",
                ))
            }
        }

        delta.source = Some(state.plugin_id.clone());
        let host = state.host.clone();
        state
            .handle
            .block_on(async move { host.publish_delta(delta).await })
            .map_err(|e| HostCallError::new(HostErrorCode::Internal, e.to_string()))
    })
}

fn host_http_fetch(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call(
        plugin,
        inputs,
        outputs,
        user_data,
        |state, req: FetchRequest| -> Result<FetchResponse, HostCallError> {
            if !(req.url.starts_with("http://") || req.url.starts_with("https://")) {
                return Err(HostCallError::invalid_input(format!(
                    "unsupported URL '{}'",
                    req.url
                )));
            }
            let host = state.host.clone();
            let timeout = std::time::Duration::from_millis(state.settings.fetch_timeout_ms);
            state
                .handle
                .block_on(async move { host.http_outbound(req, timeout).await })
                .map_err(|e| match e {
                    RuntimeError::Timeout(m) => HostCallError::new(HostErrorCode::Timeout, m),
                    RuntimeError::InvalidInput(m) => HostCallError::invalid_input(m),
                    other => HostCallError::new(HostErrorCode::FetchFailed, other.to_string()),
                })
        },
    )
}

fn host_serial_list_ports(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call_no_input(
        plugin,
        inputs,
        outputs,
        user_data,
        |state| -> Result<Vec<SerialPortInfo>, HostCallError> { Ok(state.host.serial_ports()) },
    )
}

fn host_register_put_handler(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call(
        plugin,
        inputs,
        outputs,
        user_data,
        |state, req: PutHandlerRequest| {
            validate_dotted(&req.path, "path")?;
            if req.source.is_empty() {
                return Err(HostCallError::invalid_input("empty source"));
            }
            state
                .tables
                .register_put_handler(&state.plugin_id, &req.path, &req.source)
        },
    )
}

fn host_register_resource_provider(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeState>,
) -> HostFnResult {
    host_call(
        plugin,
        inputs,
        outputs,
        user_data,
        |state, req: ResourceProviderRequest| {
            if req.resource_type.is_empty() {
                return Err(HostCallError::invalid_input("empty resource type"));
            }
            state
                .tables
                .register_resource_provider(&state.plugin_id, &req.resource_type)
        },
    )
}

// ============================================================================
// Wiring
// ============================================================================

/// Build the host-function table for one instance: real implementations for
/// granted calls, `permission_denied` stubs for the rest. Every call in
/// [`HostCall::ALL`] is present so the module always links.
pub fn create_host_functions(
    user_data: &UserData<BridgeState>,
    grant: &CapabilityGrant,
) -> Vec<extism::Function> {
    let mut functions = Vec::with_capacity(HostCall::ALL.len());
    for call in HostCall::ALL {
        let function = if grant.allows(call) {
            let f = match call {
                HostCall::Log => host_log,
                HostCall::SetStatus => host_set_status,
                HostCall::ReadConfig => host_read_config,
                HostCall::WriteConfig => host_write_config,
                HostCall::Subscribe => host_subscribe,
                HostCall::Unsubscribe => host_unsubscribe,
                HostCall::PublishDelta => host_publish_delta,
                HostCall::HttpFetch => host_http_fetch,
                HostCall::SerialListPorts => host_serial_list_ports,
                HostCall::RegisterPutHandler => host_register_put_handler,
                HostCall::RegisterResourceProvider => host_register_resource_provider,
            };
            extism::Function::new(
                call.name(),
                [ValType::I64],
                [ValType::I64],
                user_data.clone(),
                f,
            )
        } else {
            // The capability is known because only gated calls can be denied.
            let capability = call
                .capability()
                .expect("core host calls are always granted");
            extism::Function::new(
                call.name(),
                [ValType::I64],
                [ValType::I64],
                user_data.clone(),
                move |plugin: &mut CurrentPlugin,
                      _inputs: &[Val],
                      outputs: &mut [Val],
                      user_data: UserData<BridgeState>|
                      -> HostFnResult {
                    let state_arc = user_data.get()?;
                    let mut state = state_arc.lock().unwrap();
                    state.note_denied(capability);
                    let result: HostResult<()> =
                        HostResult::Err(HostCallError::permission_denied(capability));
                    write_result(plugin, outputs, &result)
                },
            )
        };
        functions.push(function);
    }
    functions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_dotted_names() {
        assert!(validate_dotted("navigation.position", "path").is_ok());
        assert!(validate_dotted("vessels.self", "context").is_ok());
        assert!(validate_dotted("", "path").is_err());
        assert!(validate_dotted("a..b", "path").is_err());
        assert!(validate_dotted("a.*", "path").is_err());
    }

    #[test]
    fn test_bound_text_respects_char_boundaries() {
        assert_eq!(bound_text("hello", 10), "hello");
        assert_eq!(bound_text("hello", 3), "hel");
        // Multi-byte characters are never split.
        let s = "dybdemåler";
        let bounded = bound_text(s, 5);
        assert!(s.starts_with(bounded));
        assert!(bounded.len() <= 5);
    }

    #[test]
    fn test_put_handler_uniqueness() {
        let tables = Tables::new();
        tables
            .register_put_handler("anchor-watch", "navigation.anchor.position", "self")
            .unwrap();
        // Same plugin may re-register.
        tables
            .register_put_handler("anchor-watch", "navigation.anchor.position", "self")
            .unwrap();
        // A different plugin may not.
        let err = tables
            .register_put_handler("other", "navigation.anchor.position", "self")
            .unwrap_err();
        assert_eq!(err.code, HostErrorCode::InvalidInput);
        // A different source is a different binding.
        tables
            .register_put_handler("other", "navigation.anchor.position", "gps2")
            .unwrap();
    }

    #[test]
    fn test_tables_cleanup_on_unload() {
        let tables = Tables::new();
        tables
            .register_put_handler("anchor-watch", "navigation.anchor.position", "self")
            .unwrap();
        tables
            .register_resource_provider("anchor-watch", "routes")
            .unwrap();
        tables.remove_plugin("anchor-watch");
        assert!(tables
            .put_handler_owner("navigation.anchor.position", "self")
            .is_none());
        // The freed resource type can be claimed again.
        tables.register_resource_provider("other", "routes").unwrap();
    }
}
