//! HTTP façade
//!
//! The operator-facing HTTP surface of the plugin runtime. Mounted twice —
//! under the legacy `/plugins` prefix and the namespaced `/api/v1/plugins`
//! prefix — so existing dashboards keep working.
//!
//! # Endpoints
//!
//! - `GET  /plugins` — aggregate listing: runtime-owned WASM plugins merged
//!   with the host's native plugins; the runtime is authoritative for each
//!   WASM plugin's `enabled` flag.
//! - `GET  /plugins/:id` — identity projection of one plugin.
//! - `GET  /plugins/:id/config` — persisted `{enabled, configuration}`.
//! - `POST /plugins/:id/config` — applies `{enabled?, configuration?}` as a
//!   single serialized operation and returns the persisted record.
//! - `GET  /plugins/:id/storage` — `{bytes}` of per-plugin disk usage.
//! - `ANY  /plugins/:id/<route>` — guest-declared routes, dispatched into
//!   the plugin's HTTP handler export and torn down with the instance.
//!
//! Errors become `{"error": <message>}` with a status chosen by category:
//! 4xx for operator input, 5xx for runtime faults.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use sdk::errors::RuntimeError;
use sdk::types::{GuestHttpRequest, PluginConfigFile};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::registry::Registry;

/// Build the façade router with both prefixes mounted.
pub fn router(registry: Arc<Registry>) -> Router {
    let plugins = plugin_routes(registry);
    Router::new()
        .nest("/plugins", plugins.clone())
        .nest("/api/v1/plugins", plugins)
        .layer(CorsLayer::permissive())
}

fn plugin_routes(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(list_plugins))
        .route("/:id", get(get_plugin))
        .route("/:id/config", get(get_config).post(post_config))
        .route("/:id/storage", get(get_storage))
        .route("/:id/*route", any(guest_route))
        .with_state(registry)
}

/// Façade error: a runtime error plus the HTTP status it maps to.
struct ApiError(RuntimeError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RuntimeError::NotRegistered(_) => StatusCode::NOT_FOUND,
            RuntimeError::InvalidInput(_)
            | RuntimeError::InvalidPluginId(_)
            | RuntimeError::Manifest(_)
            | RuntimeError::Config(_) => StatusCode::BAD_REQUEST,
            RuntimeError::NotRunning(_) => StatusCode::SERVICE_UNAVAILABLE,
            RuntimeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        Self(e)
    }
}

async fn list_plugins(State(registry): State<Arc<Registry>>) -> Json<serde_json::Value> {
    let mut plugins = registry.summaries();
    plugins.extend(registry.host().native_plugins());
    plugins.sort_by(|a, b| a.id.cmp(&b.id));
    Json(json!(plugins))
}

async fn get_plugin(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = registry
        .summary(&id)
        .ok_or_else(|| RuntimeError::NotRegistered(id))?;
    Ok(Json(json!({
        "id": summary.id,
        "name": summary.name,
        "version": summary.version,
        "enabled": summary.enabled,
        "enabledByDefault": false,
    })))
}

async fn get_config(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> Result<Json<PluginConfigFile>, ApiError> {
    Ok(Json(registry.config_of(&id)?))
}

/// Body of `POST /plugins/:id/config`. Absent fields are left unchanged.
#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    enabled: Option<bool>,
    configuration: Option<serde_json::Value>,
}

async fn post_config(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<PluginConfigFile>, ApiError> {
    let persisted = registry
        .apply_config_update(&id, update.enabled, update.configuration)
        .await?;
    Ok(Json(persisted))
}

async fn get_storage(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bytes = registry.disk_usage(&id)?;
    Ok(Json(json!({ "bytes": bytes })))
}

async fn guest_route(
    State(registry): State<Arc<Registry>>,
    Path((id, route)): Path<(String, String)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    let request = GuestHttpRequest {
        method: method.to_string(),
        path: route,
        query,
        headers: headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body: if body.is_empty() { None } else { Some(body) },
    };

    let response = registry.dispatch_guest_http(&id, request).await?;
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(response.body.unwrap_or_default()))
        .map_err(|e| ApiError(RuntimeError::InvalidInput(e.to_string())))
}
