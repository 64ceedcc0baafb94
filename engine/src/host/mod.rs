//! Host services seam
//!
//! The runtime does not own telemetry ingestion, authentication, or the
//! outer HTTP server; it consumes a narrow [`HostServices`] contract from
//! the surrounding telemetry server. [`LocalHostServices`] is the in-process
//! implementation used by the daemon binary and by tests: a broadcast-based
//! telemetry bus, a shared outbound HTTP client, and plugin-attributed log
//! routing.

use async_trait::async_trait;
use sdk::errors::RuntimeError;
use sdk::types::{Delta, FetchRequest, FetchResponse, PluginSummary, SerialPortInfo};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;

/// Telemetry-bus channel depth for the local implementation.
const BUS_CAPACITY: usize = 1024;

/// Services the runtime consumes from the surrounding server.
#[async_trait]
pub trait HostServices: Send + Sync {
    /// Root directory for per-plugin storage.
    fn config_root(&self) -> PathBuf;

    /// Append a delta to the host telemetry bus. The caller has already
    /// tagged the delta with its source plugin.
    async fn publish_delta(&self, delta: Delta) -> Result<(), RuntimeError>;

    /// Subscribe to the host telemetry stream.
    fn subscribe_bus(&self) -> broadcast::Receiver<Delta>;

    /// Route a plugin log line into the host log.
    fn log(&self, level: &str, plugin_id: &str, message: &str);

    /// Perform an outbound HTTP request on behalf of a `network`-capable
    /// plugin, bounded by `timeout`.
    async fn http_outbound(
        &self,
        request: FetchRequest,
        timeout: Duration,
    ) -> Result<FetchResponse, RuntimeError>;

    /// Enumerate serial ports visible to the host.
    fn serial_ports(&self) -> Vec<SerialPortInfo> {
        Vec::new()
    }

    /// Classical host-native plugins, opaque to this runtime, merged into
    /// the aggregate plugin listing.
    fn native_plugins(&self) -> Vec<PluginSummary> {
        Vec::new()
    }
}

/// In-process [`HostServices`] implementation.
pub struct LocalHostServices {
    config_root: PathBuf,
    bus: broadcast::Sender<Delta>,
    http: reqwest::Client,
}

impl LocalHostServices {
    pub fn new(config_root: impl AsRef<Path>) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            config_root: config_root.as_ref().to_path_buf(),
            bus,
            http: reqwest::Client::new(),
        }
    }

    /// Sender half of the telemetry bus, for feeding host-side deltas in
    /// tests and from the server's ingestion pipeline.
    pub fn bus_sender(&self) -> broadcast::Sender<Delta> {
        self.bus.clone()
    }
}

#[async_trait]
impl HostServices for LocalHostServices {
    fn config_root(&self) -> PathBuf {
        self.config_root.clone()
    }

    async fn publish_delta(&self, mut delta: Delta) -> Result<(), RuntimeError> {
        if delta.timestamp.is_none() {
            delta.timestamp = Some(chrono::Utc::now());
        }
        // A send error only means there are no subscribers right now.
        let _ = self.bus.send(delta);
        Ok(())
    }

    fn subscribe_bus(&self) -> broadcast::Receiver<Delta> {
        self.bus.subscribe()
    }

    fn log(&self, level: &str, plugin_id: &str, message: &str) {
        match level {
            "error" => tracing::error!(plugin = plugin_id, "{}", message),
            "warn" => tracing::warn!(plugin = plugin_id, "{}", message),
            "debug" => tracing::debug!(plugin = plugin_id, "{}", message),
            "trace" => tracing::trace!(plugin = plugin_id, "{}", message),
            _ => tracing::info!(plugin = plugin_id, "{}", message),
        }
    }

    async fn http_outbound(
        &self,
        request: FetchRequest,
        timeout: Duration,
    ) -> Result<FetchResponse, RuntimeError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| RuntimeError::InvalidInput(format!("bad method '{}'", request.method)))?;

        let mut builder = self.http.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RuntimeError::Timeout(format!("fetch {}", request.url))
            } else {
                RuntimeError::Fetch(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| RuntimeError::Fetch(e.to_string()))?;

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_stamps_timestamp() {
        let host = LocalHostServices::new("/tmp/pelorus-test");
        let mut rx = host.subscribe_bus();

        host.publish_delta(Delta {
            context: "vessels.self".into(),
            source: Some("anchor-watch".into()),
            timestamp: None,
            values: vec![sdk::types::PathValue {
                path: "navigation.position".into(),
                value: json!({"latitude": 60.0}),
            }],
        })
        .await
        .unwrap();

        let delta = rx.recv().await.unwrap();
        assert!(delta.timestamp.is_some());
        assert_eq!(delta.source.as_deref(), Some("anchor-watch"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let host = LocalHostServices::new("/tmp/pelorus-test");
        host.publish_delta(Delta {
            context: "vessels.self".into(),
            source: None,
            timestamp: None,
            values: vec![],
        })
        .await
        .unwrap();
    }
}
