//! Shared runtime types
//!
//! Telemetry deltas, the persisted per-plugin configuration shape, status
//! projections served by the HTTP façade, and the JSON envelopes exchanged
//! with guests over the host-call boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Telemetry
// ============================================================================

/// A single dotted-path update inside a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    /// Dotted path of the data point (e.g. `navigation.position`).
    pub path: String,
    /// Arbitrary JSON value.
    pub value: serde_json::Value,
}

/// An atomic telemetry update.
///
/// Carries the context it applies to (e.g. a vessel) and a sequence of
/// `(path, value)` pairs. Deltas published by plugins are tagged with the
/// plugin id as `source` by the bridge before they reach the host bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Dotted context the values belong to (e.g. `vessels.self`).
    pub context: String,
    /// Origin of the delta; filled in by the host for plugin-published deltas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Publish timestamp; host-assigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Updated values.
    pub values: Vec<PathValue>,
}

impl Delta {
    /// Full dotted names covered by this delta (`context.path` per value).
    pub fn full_paths(&self) -> impl Iterator<Item = String> + '_ {
        self.values
            .iter()
            .map(move |pv| format!("{}.{}", self.context, pv.path))
    }
}

// ============================================================================
// Persisted configuration
// ============================================================================

/// Contents of the server-managed `<plugin_id>.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfigFile {
    /// Whether the plugin should be running.
    #[serde(default)]
    pub enabled: bool,
    /// Arbitrary plugin configuration, handed to the guest's `start`.
    #[serde(default = "empty_object")]
    pub configuration: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Default for PluginConfigFile {
    fn default() -> Self {
        Self {
            enabled: false,
            configuration: empty_object(),
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Error,
}

/// Projection of a plugin record served by the HTTP façade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub enabled: bool,
    /// Always false; plugins start disabled until an operator enables them.
    pub enabled_by_default: bool,
    pub status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub crash_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_crash_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Host-call ABI
// ============================================================================

/// Error codes returned to guests across the host-call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostErrorCode {
    /// The call is not in the capability grant.
    PermissionDenied,
    /// The granted call is currently disabled (e.g. publishing while stopping).
    Disabled,
    /// Host-side input validation rejected the request.
    InvalidInput,
    /// The owning record is not in a state that accepts this call.
    NotRunning,
    /// DNS/connect/timeout failure of an outbound fetch.
    FetchFailed,
    /// A bounded operation overran its budget.
    Timeout,
    /// Anything else; details in the message.
    Internal,
}

/// Error payload of a failed host call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCallError {
    pub code: HostErrorCode,
    pub message: String,
}

impl HostCallError {
    pub fn new(code: HostErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn permission_denied(capability: &str) -> Self {
        Self::new(
            HostErrorCode::PermissionDenied,
            format!("capability '{capability}' not granted"),
        )
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(HostErrorCode::InvalidInput, message)
    }
}

/// Result envelope for every host call: `{"ok": ...}` or
/// `{"err": {"code": ..., "message": ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostResult<T> {
    Ok(T),
    Err(HostCallError),
}

impl<T> From<Result<T, HostCallError>> for HostResult<T> {
    fn from(result: Result<T, HostCallError>) -> Self {
        match result {
            Ok(v) => HostResult::Ok(v),
            Err(e) => HostResult::Err(e),
        }
    }
}

/// `subscribe` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Dotted path pattern, `*` matching exactly one segment.
    pub pattern: String,
}

/// `subscribe` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub subscription_id: String,
}

/// `unsubscribe` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub subscription_id: String,
}

/// `log` request. Messages beyond the host's length bound are truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequest {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    pub level: String,
    pub message: String,
}

/// `set_status` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusRequest {
    pub message: String,
}

/// `register_put_handler` request. Only one handler per `(path, source)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutHandlerRequest {
    pub path: String,
    pub source: String,
}

/// `register_resource_provider` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceProviderRequest {
    #[serde(rename = "type")]
    pub resource_type: String,
}

/// `serial_list_ports` response entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortInfo {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
}

// ============================================================================
// Outbound HTTP (`http_fetch`)
// ============================================================================

/// Minimal HTTP request shape for the `http_fetch` host call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Response shape of `http_fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

// ============================================================================
// Guest-declared HTTP endpoints
// ============================================================================

/// One entry of the guest's `http_endpoints` export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEndpointDecl {
    /// HTTP method (`GET`, `POST`, ...).
    pub method: String,
    /// Route path relative to the plugin mount (no leading slash required).
    pub path: String,
    /// Guest export invoked for this route.
    #[serde(default = "default_http_handler")]
    pub handler: String,
}

fn default_http_handler() -> String {
    "handle_http".to_string()
}

/// Request envelope handed to a guest HTTP handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestHttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Response envelope returned by a guest HTTP handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestHttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}
