//! Daemon lifecycle
//!
//! Wires the runtime together: host services, registry, package discovery,
//! the telemetry dispatcher, the periodic tmp sweep, and the HTTP façade.
//! Shutdown stops every plugin (parallel across records, serialized per
//! record), cancels background tasks, and lets the module handles drop.

use sdk::errors::RuntimeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::host::{HostServices, LocalHostServices};
use crate::registry::{discovery, Registry};

/// A running daemon: the registry plus its background tasks.
pub struct Daemon {
    registry: Arc<Registry>,
    dispatcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl Daemon {
    /// Boot the runtime: build host services and the registry, scan the
    /// package directory, and launch the background tasks. Plugins whose
    /// persisted config says `enabled: true` start automatically.
    pub async fn boot(settings: Settings) -> Result<Self, RuntimeError> {
        let host: Arc<dyn HostServices> =
            Arc::new(LocalHostServices::new(&settings.core.config_root));
        Self::boot_with_host(settings, host).await
    }

    /// Boot against externally provided host services (embedding servers
    /// pass their own implementation here).
    pub async fn boot_with_host(
        settings: Settings,
        host: Arc<dyn HostServices>,
    ) -> Result<Self, RuntimeError> {
        let registry = Registry::new(host, settings.clone());

        discovery::scan_and_register(&registry, &settings.core.package_dir).await;

        let dispatcher = spawn_dispatcher(registry.clone());
        let sweeper = spawn_tmp_sweeper(
            registry.clone(),
            Duration::from_secs(settings.bridge.tmp_sweep_interval_secs),
        );

        Ok(Self {
            registry,
            dispatcher,
            sweeper,
        })
    }

    /// The registry, for the HTTP façade and embedding hosts.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Graceful shutdown: cancel background tasks, then stop all plugins.
    pub async fn shutdown(self) {
        self.dispatcher.abort();
        self.sweeper.abort();
        self.registry.shutdown().await;
    }
}

/// Pump the host telemetry bus into the subscription manager. Delivery
/// failures are observed as plugin faults.
fn spawn_dispatcher(registry: Arc<Registry>) -> JoinHandle<()> {
    let mut rx = registry.host().subscribe_bus();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(delta) => {
                    let failures = registry.subscriptions().dispatch(&delta).await;
                    for failure in failures {
                        registry
                            .observe_fault(&failure.plugin_id, failure.error)
                            .await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Telemetry dispatcher lagged; skipped {} deltas", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Periodically clear every plugin's `vfs/tmp`.
fn spawn_tmp_sweeper(registry: Arc<Registry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; plugins clear tmp on start
        // anyway, so skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.sweep_tmp();
        }
    })
}
