//! Plugin registry and lifecycle
//!
//! The registry is the single source of truth for plugin status. It owns one
//! record per registered plugin and drives the state machine
//!
//! ```text
//!               register
//!                  │
//!                  ▼
//!             ┌─Stopped◄──────────────┐
//!  enable()   │   ▲                   │ stop()/unload
//!             ▼   │ stop() ok         │
//!          Starting                   │
//!             │                       │
//!  start()=0  │           start()≠0   │
//!             ▼           ─────────► Error
//!          Running                    ▲
//!             │   observed fault      │
//!             ▼ ────────────────► Crashed ──► (timer) ──► Starting
//!          Stopping ──────► Stopped
//! ```
//!
//! # Serialization
//!
//! Lifecycle operations on one record (`start`, `stop`, `reload`,
//! `set_enabled`, `update_configuration`) are totally ordered by a per-record
//! async operation mutex. Record *state* sits behind a separate short-lived
//! mutex so guest-invoked host calls (read/write config, set_status) never
//! wait on an in-flight operation — a guest calling `write_config` from
//! inside its own `start` schedules the follow-up restart on a spawned task
//! that queues behind the current operation instead of deadlocking on it.
//! Operations on distinct records are independent.
//!
//! # Crash supervision
//!
//! A post-start fault moves the record to `Crashed`, increments the
//! consecutive-crash counter, and schedules a restart after an exponential
//! backoff (doubling from `backoff_initial_ms`, capped at `backoff_cap_ms`).
//! After `max_consecutive_crashes` the record moves to `Error` and automatic
//! restart stops until an operator reloads or re-enables the plugin. The
//! counter resets only once an instance has stayed `Running` for the grace
//! window, so a fast start-crash loop cannot escape the limit.

pub mod discovery;

use chrono::{DateTime, Utc};
use sdk::errors::RuntimeError;
use sdk::manifest::PluginManifest;
use sdk::types::{GuestHttpRequest, GuestHttpResponse, PluginConfigFile, PluginStatus,
    PluginSummary};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::bridge::{BridgeState, RecordHooks, Tables};
use crate::capabilities::CapabilityGrant;
use crate::config::Settings;
use crate::host::HostServices;
use crate::runtime::{ModuleRuntime, PluginIdentity, PluginInstance};
use crate::subscriptions::SubscriptionManager;
use crate::vfs::{self, StoragePaths};

/// Error message shown once the crash limit is reached.
const REPEATED_CRASH_MESSAGE: &str = "repeatedly crashing, automatic restart disabled";

/// Mutable state of one record, behind a short-critical-section mutex.
struct RecordState {
    enabled: bool,
    configuration: Value,
    status: PluginStatus,
    status_message: Option<String>,
    error_message: Option<String>,
    crash_count: u32,
    last_crash_at: Option<DateTime<Utc>>,
    backoff_ms: u64,
    /// Bumped on every successful start; lets the grace timer verify it is
    /// still looking at the instance it was armed for.
    generation: u64,
    instance: Option<Arc<PluginInstance>>,
    restart_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
}

/// One registered plugin. Outlives its instances.
pub struct PluginRecord {
    pub plugin_id: String,
    pub identity: PluginIdentity,
    pub manifest: PluginManifest,
    pub storage: StoragePaths,
    /// Serializes lifecycle operations on this record.
    op: AsyncMutex<()>,
    state: StdMutex<RecordState>,
}

/// Why a stop is happening; decides whether subscription intent survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    /// Operator disable or uninstall: subscriptions and registrations drop.
    Unload,
    /// Reload/config-update gap or shutdown: subscription intent survives.
    Suspend,
}

/// Process-wide plugin registry.
///
/// Not a singleton: the daemon owns one and hands it to the HTTP façade and
/// the telemetry dispatcher.
pub struct Registry {
    records: RwLock<HashMap<String, Arc<PluginRecord>>>,
    host: Arc<dyn HostServices>,
    subscriptions: Arc<SubscriptionManager>,
    tables: Arc<Tables>,
    module_runtime: ModuleRuntime,
    settings: Settings,
    handle: tokio::runtime::Handle,
    weak_self: Weak<Registry>,
}

impl Registry {
    /// Build a registry. Must be called from within a tokio runtime.
    pub fn new(host: Arc<dyn HostServices>, settings: Settings) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            records: RwLock::new(HashMap::new()),
            host,
            subscriptions: Arc::new(SubscriptionManager::new(settings.bridge.buffer_capacity)),
            tables: Tables::new(),
            module_runtime: ModuleRuntime::new(settings.lifecycle.clone()),
            handle: tokio::runtime::Handle::current(),
            settings,
            weak_self: weak.clone(),
        })
    }

    fn strong(&self) -> Arc<Registry> {
        self.weak_self
            .upgrade()
            .expect("registry accessed after drop")
    }

    /// The subscription manager, for the telemetry dispatcher.
    pub fn subscriptions(&self) -> Arc<SubscriptionManager> {
        self.subscriptions.clone()
    }

    /// The host services this registry was built with.
    pub fn host(&self) -> Arc<dyn HostServices> {
        self.host.clone()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a plugin package.
    ///
    /// Loads the module transiently to resolve its identity, allocates
    /// storage, reads (or persists) the config file, and enqueues a start if
    /// the plugin is enabled. A second registration resolving to an already
    /// registered plugin id is a fatal registration error.
    pub async fn register(&self, manifest: PluginManifest) -> Result<String, RuntimeError> {
        let identity = self.module_runtime.probe(&manifest).await?;
        let plugin_id = identity.id.clone();

        {
            let records = self.records.read().unwrap();
            if records.contains_key(&plugin_id) {
                return Err(RuntimeError::DuplicateId(plugin_id));
            }
        }

        let storage = vfs::resolve(&plugin_id, &self.host.config_root())?;
        let existed = storage.root.exists();
        vfs::initialize(&storage)?;

        let registered = self
            .finish_registration(&plugin_id, identity, manifest, &storage)
            .await;
        match registered {
            Ok(enabled) => {
                tracing::info!("Plugin '{}' registered (enabled: {})", plugin_id, enabled);
                if enabled {
                    let registry = self.strong();
                    let id = plugin_id.clone();
                    self.handle.spawn(async move {
                        if let Err(e) = registry.start(&id).await {
                            tracing::error!("Auto-start of plugin '{}' failed: {}", id, e);
                        }
                    });
                }
                Ok(plugin_id)
            }
            Err(e) => {
                // Roll back storage we created for a plugin that never made
                // it into the registry.
                if !existed {
                    let _ = vfs::destroy(&storage);
                }
                Err(e)
            }
        }
    }

    async fn finish_registration(
        &self,
        plugin_id: &str,
        identity: PluginIdentity,
        manifest: PluginManifest,
        storage: &StoragePaths,
    ) -> Result<bool, RuntimeError> {
        let config = vfs::read_config(storage)?;
        if !storage.config_file.exists() {
            vfs::write_config(storage, &config)
                .map_err(|e| RuntimeError::ConfigWrite(e.to_string()))?;
        }

        let record = Arc::new(PluginRecord {
            plugin_id: plugin_id.to_string(),
            identity,
            manifest,
            storage: storage.clone(),
            op: AsyncMutex::new(()),
            state: StdMutex::new(RecordState {
                enabled: config.enabled,
                configuration: config.configuration,
                status: PluginStatus::Stopped,
                status_message: None,
                error_message: None,
                crash_count: 0,
                last_crash_at: None,
                backoff_ms: self.settings.lifecycle.backoff_initial_ms,
                generation: 0,
                instance: None,
                restart_timer: None,
                grace_timer: None,
            }),
        });

        let mut records = self.records.write().unwrap();
        if records.contains_key(plugin_id) {
            return Err(RuntimeError::DuplicateId(plugin_id.to_string()));
        }
        let enabled = config.enabled;
        records.insert(plugin_id.to_string(), record);
        Ok(enabled)
    }

    /// Unregister a plugin and destroy its storage. Used on uninstall.
    pub async fn unregister(&self, plugin_id: &str) -> Result<(), RuntimeError> {
        let record = self.record(plugin_id)?;
        {
            let _op = record.op.lock().await;
            self.stop_locked(&record, StopKind::Unload).await;
        }
        self.records.write().unwrap().remove(plugin_id);
        vfs::destroy(&record.storage)?;
        tracing::info!("Plugin '{}' unregistered", plugin_id);
        Ok(())
    }

    fn record(&self, plugin_id: &str) -> Result<Arc<PluginRecord>, RuntimeError> {
        self.records
            .read()
            .unwrap()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotRegistered(plugin_id.to_string()))
    }

    // ========================================================================
    // Lifecycle operations (public surface acquires the op mutex)
    // ========================================================================

    /// Start a plugin. Idempotent when already running.
    pub async fn start(&self, plugin_id: &str) -> Result<(), RuntimeError> {
        let record = self.record(plugin_id)?;
        let _op = record.op.lock().await;
        self.start_locked(&record).await
    }

    /// Stop a plugin. Idempotent; `stop` on a stopped plugin is a no-op.
    /// Cancels any pending crash-restart timer. Subscription intent is
    /// retained so a later start resumes buffered deltas.
    pub async fn stop(&self, plugin_id: &str) -> Result<(), RuntimeError> {
        let record = self.record(plugin_id)?;
        let _op = record.op.lock().await;
        self.stop_locked(&record, StopKind::Suspend).await;
        Ok(())
    }

    /// Hot-reload: unload the current instance and load a fresh one from the
    /// same module path, preserving configuration and subscription intent.
    /// Clears the crash counter; this is the operator's way out of `Error`.
    pub async fn reload(&self, plugin_id: &str) -> Result<(), RuntimeError> {
        let record = self.record(plugin_id)?;
        let _op = record.op.lock().await;

        self.stop_locked(&record, StopKind::Suspend).await;
        let enabled = {
            let mut st = record.state.lock().unwrap();
            st.crash_count = 0;
            st.backoff_ms = self.settings.lifecycle.backoff_initial_ms;
            st.error_message = None;
            st.enabled
        };
        if enabled {
            self.start_locked(&record).await?;
        }
        Ok(())
    }

    /// Enable or disable a plugin, persisting the flag. Enabling starts the
    /// plugin (and resets the crash counter); disabling stops it and drops
    /// its subscriptions. Idempotent.
    pub async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), RuntimeError> {
        self.apply_config_update(plugin_id, Some(enabled), None)
            .await
            .map(|_| ())
    }

    /// Replace the plugin's configuration, persisting it atomically before
    /// any restart is observable. A running plugin is stop/started so the
    /// guest sees the new configuration through `start`.
    pub async fn update_configuration(
        &self,
        plugin_id: &str,
        configuration: Value,
    ) -> Result<(), RuntimeError> {
        self.apply_config_update(plugin_id, None, Some(configuration))
            .await
            .map(|_| ())
    }

    /// Apply an operator config edit — enabled flag, configuration, or both —
    /// as one serialized operation with a single atomic persist. Returns the
    /// persisted record.
    pub async fn apply_config_update(
        &self,
        plugin_id: &str,
        enabled: Option<bool>,
        configuration: Option<Value>,
    ) -> Result<PluginConfigFile, RuntimeError> {
        let record = self.record(plugin_id)?;
        let _op = record.op.lock().await;

        let config_changed = configuration.is_some();
        self.persist_locked(&record, enabled, configuration)?;

        let was_running = {
            let st = record.state.lock().unwrap();
            matches!(st.status, PluginStatus::Running)
        };

        match enabled {
            Some(false) => {
                self.stop_locked(&record, StopKind::Unload).await;
            }
            Some(true) => {
                {
                    let mut st = record.state.lock().unwrap();
                    st.crash_count = 0;
                    st.backoff_ms = self.settings.lifecycle.backoff_initial_ms;
                    st.error_message = None;
                }
                if was_running && config_changed {
                    self.stop_locked(&record, StopKind::Suspend).await;
                    self.start_locked(&record).await?;
                } else if !was_running {
                    self.start_locked(&record).await?;
                }
            }
            None => {
                if was_running && config_changed {
                    self.stop_locked(&record, StopKind::Suspend).await;
                    self.start_locked(&record).await?;
                }
            }
        }

        let st = record.state.lock().unwrap();
        Ok(PluginConfigFile {
            enabled: st.enabled,
            configuration: st.configuration.clone(),
        })
    }

    /// Stop every record (parallel across records, serialized per record),
    /// cancel all timers, and release module handles.
    pub async fn shutdown(&self) {
        let records: Vec<Arc<PluginRecord>> =
            self.records.read().unwrap().values().cloned().collect();
        let mut tasks = Vec::new();
        for record in records {
            let registry = self.strong();
            tasks.push(self.handle.spawn(async move {
                let _op = record.op.lock().await;
                registry.stop_locked(&record, StopKind::Suspend).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("All plugins stopped");
    }

    // ========================================================================
    // Lifecycle internals (op mutex held by caller)
    // ========================================================================

    // Written as a manually boxed future (instead of `async fn`) because it
    // mutually recurses with `observe_fault` via the crash-restart timer
    // (start_locked -> observe_fault -> spawned restart -> start_locked).
    // That cycle runs through two separate opaque `async fn` return types and
    // rustc's auto-trait (Send) inference cannot resolve it; boxing this one
    // side breaks the cycle without changing behavior.
    fn start_locked<'a>(
        &'a self,
        record: &'a Arc<PluginRecord>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>>
    {
        Box::pin(async move {
            {
                let mut st = record.state.lock().unwrap();
                match st.status {
                    PluginStatus::Running | PluginStatus::Starting => return Ok(()),
                    _ => {}
                }
                // A crashed instance's handles are released here, before the
                // replacement is created.
                st.instance = None;
                st.status = PluginStatus::Starting;
                st.error_message = None;
            }

            // Open the buffering window so subscribe calls made during start
            // land somewhere and early deltas queue up.
            self.subscriptions.detach(&record.plugin_id).await;

            if let Err(e) = vfs::cleanup_tmp(&record.storage) {
                self.fail_start(record, &e);
                return Err(e);
            }

            let grant = CapabilityGrant::new(record.manifest.capabilities.clone());
            let bridge_state = BridgeState::new(
                record.plugin_id.clone(),
                grant.clone(),
                self.host.clone(),
                self.subscriptions.clone(),
                self.strong() as Arc<dyn RecordHooks>,
                self.tables.clone(),
                self.handle.clone(),
                self.settings.bridge.clone(),
            );

            let instance = match self
                .module_runtime
                .load(&record.manifest, &record.storage, &grant, bridge_state)
                .await
            {
                Ok(instance) => instance,
                Err(e) => {
                    self.fail_start(record, &e);
                    return Err(e);
                }
            };

            let configuration = {
                let st = record.state.lock().unwrap();
                st.configuration.clone()
            };
            let budget = Duration::from_millis(self.settings.lifecycle.start_timeout_ms);

            match instance.call_start(&configuration, budget).await {
                Ok(()) => {
                    let generation = {
                        let mut st = record.state.lock().unwrap();
                        st.status = PluginStatus::Running;
                        st.instance = Some(instance.clone());
                        st.generation += 1;
                        st.generation
                    };
                    self.arm_grace_timer(record, generation);

                    let failures = self
                        .subscriptions
                        .attach(&record.plugin_id, instance.delta_sink())
                        .await;
                    tracing::info!("Plugin '{}' running", record.plugin_id);
                    if let Some(failure) = failures.into_iter().next() {
                        self.observe_fault(&record.plugin_id, failure.error).await;
                    }
                    Ok(())
                }
                Err(e) => {
                    self.module_runtime.unload(&instance).await;
                    self.fail_start(record, &e);
                    Err(e)
                }
            }
        })
    }

    fn fail_start(&self, record: &Arc<PluginRecord>, error: &RuntimeError) {
        tracing::error!("Plugin '{}' failed to start: {}", record.plugin_id, error);
        let mut st = record.state.lock().unwrap();
        st.status = PluginStatus::Error;
        st.instance = None;
        st.error_message = Some(error.to_string());
    }

    async fn stop_locked(&self, record: &Arc<PluginRecord>, kind: StopKind) {
        let instance = {
            let mut st = record.state.lock().unwrap();
            if let Some(timer) = st.restart_timer.take() {
                timer.abort();
            }
            if let Some(timer) = st.grace_timer.take() {
                timer.abort();
            }
            let instance = st.instance.take();
            if instance.is_some() {
                st.status = PluginStatus::Stopping;
            }
            instance
        };

        if let Some(instance) = instance {
            self.subscriptions.detach(&record.plugin_id).await;
            self.module_runtime.unload(&instance).await;
        }

        {
            let mut st = record.state.lock().unwrap();
            st.status = PluginStatus::Stopped;
        }

        if kind == StopKind::Unload {
            self.subscriptions.remove_plugin(&record.plugin_id).await;
            self.tables.remove_plugin(&record.plugin_id);
        }
        tracing::debug!("Plugin '{}' stopped", record.plugin_id);
    }

    /// Persist `enabled` and/or `configuration`, rolling in-memory state
    /// forward only if the write lands.
    fn persist_locked(
        &self,
        record: &Arc<PluginRecord>,
        enabled: Option<bool>,
        configuration: Option<Value>,
    ) -> Result<(), RuntimeError> {
        let (new_enabled, new_configuration) = {
            let st = record.state.lock().unwrap();
            (
                enabled.unwrap_or(st.enabled),
                configuration.unwrap_or_else(|| st.configuration.clone()),
            )
        };
        let file = PluginConfigFile {
            enabled: new_enabled,
            configuration: new_configuration.clone(),
        };
        vfs::write_config(&record.storage, &file)
            .map_err(|e| RuntimeError::ConfigWrite(e.to_string()))?;

        let mut st = record.state.lock().unwrap();
        st.enabled = new_enabled;
        st.configuration = new_configuration;
        Ok(())
    }

    // ========================================================================
    // Crash supervision
    // ========================================================================

    /// Record a post-start fault: guest trap, failed delta delivery, or a
    /// host-call violation observed outside a lifecycle operation.
    ///
    /// Moves the record to `Crashed`, schedules a backed-off restart, and
    /// disables automatic restart after the crash limit. Only takes the
    /// state mutex, so it is safe to call from anywhere.
    pub async fn observe_fault(&self, plugin_id: &str, error: RuntimeError) {
        let record = match self.record(plugin_id) {
            Ok(record) => record,
            Err(_) => return,
        };

        let backoff_ms = {
            let mut st = record.state.lock().unwrap();
            if st.status != PluginStatus::Running {
                // Already being handled (stop in progress, prior crash, ...).
                return;
            }
            if let Some(timer) = st.grace_timer.take() {
                timer.abort();
            }
            st.status = PluginStatus::Crashed;
            st.crash_count += 1;
            st.last_crash_at = Some(Utc::now());
            st.error_message = Some(error.to_string());

            let lifecycle = &self.settings.lifecycle;
            let backoff_ms = next_backoff_ms(
                st.crash_count,
                lifecycle.backoff_initial_ms,
                lifecycle.backoff_cap_ms,
            );
            st.backoff_ms = backoff_ms;

            tracing::error!(
                "Plugin '{}' crashed (crash #{}): {}",
                plugin_id,
                st.crash_count,
                error
            );

            if st.crash_count >= lifecycle.max_consecutive_crashes {
                st.status = PluginStatus::Error;
                st.error_message = Some(REPEATED_CRASH_MESSAGE.to_string());
                tracing::error!(
                    "Plugin '{}' reached the crash limit; automatic restart disabled",
                    plugin_id
                );
                None
            } else {
                Some(backoff_ms)
            }
        };

        // Buffer deltas while the plugin is down.
        self.subscriptions.detach(plugin_id).await;

        if let Some(backoff_ms) = backoff_ms {
            let registry = self.strong();
            let id = plugin_id.to_string();
            let timer = self.handle.spawn(async move {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                registry.restart_after_crash(&id).await;
            });
            let mut st = record.state.lock().unwrap();
            if let Some(old) = st.restart_timer.replace(timer) {
                old.abort();
            }
        }
    }

    async fn restart_after_crash(&self, plugin_id: &str) {
        let record = match self.record(plugin_id) {
            Ok(record) => record,
            Err(_) => return,
        };
        let _op = record.op.lock().await;
        let should_start = {
            let st = record.state.lock().unwrap();
            st.enabled && st.status == PluginStatus::Crashed
        };
        if !should_start {
            return;
        }
        tracing::info!("Restarting crashed plugin '{}'", plugin_id);
        if let Err(e) = self.start_locked(&record).await {
            tracing::error!("Restart of plugin '{}' failed: {}", plugin_id, e);
        }
    }

    fn arm_grace_timer(&self, record: &Arc<PluginRecord>, generation: u64) {
        let registry = self.strong();
        let plugin_id = record.plugin_id.clone();
        let grace = Duration::from_millis(self.settings.lifecycle.grace_period_ms);
        let timer = self.handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Ok(record) = registry.record(&plugin_id) {
                let mut st = record.state.lock().unwrap();
                if st.status == PluginStatus::Running && st.generation == generation {
                    st.crash_count = 0;
                    st.backoff_ms = registry.settings.lifecycle.backoff_initial_ms;
                }
            }
        });
        let mut st = record.state.lock().unwrap();
        if let Some(old) = st.grace_timer.replace(timer) {
            old.abort();
        }
    }

    // ========================================================================
    // Projections and guest HTTP dispatch
    // ========================================================================

    /// Status projection for one plugin.
    pub fn summary(&self, plugin_id: &str) -> Option<PluginSummary> {
        let record = self.records.read().unwrap().get(plugin_id).cloned()?;
        Some(project(&record))
    }

    /// Status projections for every registered plugin, sorted by id.
    pub fn summaries(&self) -> Vec<PluginSummary> {
        let mut all: Vec<PluginSummary> = self
            .records
            .read()
            .unwrap()
            .values()
            .map(|record| project(record))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Persisted config projection (`{enabled, configuration}`).
    pub fn config_of(&self, plugin_id: &str) -> Result<PluginConfigFile, RuntimeError> {
        let record = self.record(plugin_id)?;
        let st = record.state.lock().unwrap();
        Ok(PluginConfigFile {
            enabled: st.enabled,
            configuration: st.configuration.clone(),
        })
    }

    /// Bytes stored under a plugin's storage root.
    pub fn disk_usage(&self, plugin_id: &str) -> Result<u64, RuntimeError> {
        let record = self.record(plugin_id)?;
        vfs::disk_usage(&record.storage)
    }

    /// Routes declared by a plugin's current instance.
    pub fn guest_endpoints(&self, plugin_id: &str) -> Vec<sdk::types::HttpEndpointDecl> {
        let Ok(record) = self.record(plugin_id) else {
            return Vec::new();
        };
        let st = record.state.lock().unwrap();
        st.instance
            .as_ref()
            .map(|i| i.endpoints.clone())
            .unwrap_or_default()
    }

    /// Dispatch an HTTP request to a guest-declared route. A guest trap
    /// during handling is observed as a crash.
    pub async fn dispatch_guest_http(
        &self,
        plugin_id: &str,
        request: GuestHttpRequest,
    ) -> Result<GuestHttpResponse, RuntimeError> {
        let record = self.record(plugin_id)?;
        let (instance, handler) = {
            let st = record.state.lock().unwrap();
            let instance = st
                .instance
                .as_ref()
                .cloned()
                .ok_or_else(|| RuntimeError::NotRunning(plugin_id.to_string()))?;
            let handler = instance
                .endpoints
                .iter()
                .find(|e| {
                    e.method.eq_ignore_ascii_case(&request.method)
                        && e.path.trim_start_matches('/') == request.path.trim_start_matches('/')
                })
                .map(|e| e.handler.clone())
                .ok_or_else(|| {
                    RuntimeError::InvalidInput(format!("no such route '{}'", request.path))
                })?;
            (instance, handler)
        };

        let input = serde_json::to_vec(&request)
            .map_err(|e| RuntimeError::InvalidInput(e.to_string()))?;
        let budget = Duration::from_millis(self.settings.lifecycle.start_timeout_ms);
        match instance.call_json(&handler, input, budget).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                RuntimeError::Crash(format!("guest returned malformed HTTP response: {e}"))
            }),
            Err(e) => {
                self.observe_fault(plugin_id, RuntimeError::Crash(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Route a host PUT action to the plugin that registered a handler for
    /// `(path, source)`. The guest's `handle_put` export receives the value
    /// and returns a JSON result; a trap is observed as a crash.
    pub async fn dispatch_put(
        &self,
        path: &str,
        source: &str,
        value: Value,
    ) -> Result<Value, RuntimeError> {
        let owner = self.tables.put_handler_owner(path, source).ok_or_else(|| {
            RuntimeError::InvalidInput(format!("no PUT handler for ({path}, {source})"))
        })?;
        let record = self.record(&owner)?;
        let instance = {
            let st = record.state.lock().unwrap();
            st.instance
                .as_ref()
                .cloned()
                .ok_or_else(|| RuntimeError::NotRunning(owner.clone()))?
        };

        let input = serde_json::to_vec(&serde_json::json!({
            "path": path,
            "source": source,
            "value": value,
        }))
        .map_err(|e| RuntimeError::InvalidInput(e.to_string()))?;
        let budget = Duration::from_millis(self.settings.lifecycle.start_timeout_ms);
        match instance.call_json("handle_put", input, budget).await {
            Ok(bytes) if bytes.is_empty() => Ok(Value::Null),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                RuntimeError::Crash(format!("guest returned malformed PUT result: {e}"))
            }),
            Err(e) => {
                self.observe_fault(&owner, RuntimeError::Crash(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Sweep every plugin's `vfs/tmp`. Run periodically by the daemon.
    pub fn sweep_tmp(&self) {
        let records: Vec<Arc<PluginRecord>> =
            self.records.read().unwrap().values().cloned().collect();
        for record in records {
            if let Err(e) = vfs::cleanup_tmp(&record.storage) {
                tracing::warn!(
                    "tmp sweep for plugin '{}' failed: {}",
                    record.plugin_id,
                    e
                );
            }
        }
    }
}

fn project(record: &Arc<PluginRecord>) -> PluginSummary {
    let st = record.state.lock().unwrap();
    PluginSummary {
        id: record.plugin_id.clone(),
        name: record.identity.name.clone(),
        version: record.manifest.plugin_version.clone(),
        enabled: st.enabled,
        enabled_by_default: false,
        status: st.status,
        status_message: st.status_message.clone(),
        error_message: st.error_message.clone(),
        crash_count: st.crash_count,
        last_crash_at: st.last_crash_at,
    }
}

/// Exponential restart backoff: doubles per consecutive crash, capped.
fn next_backoff_ms(crash_count: u32, initial_ms: u64, cap_ms: u64) -> u64 {
    let exponent = crash_count.saturating_sub(1).min(31);
    initial_ms.saturating_mul(1u64 << exponent).min(cap_ms)
}

// ============================================================================
// Bridge hooks
// ============================================================================

impl RecordHooks for Registry {
    fn read_configuration(&self, plugin_id: &str) -> Value {
        self.record(plugin_id)
            .map(|record| record.state.lock().unwrap().configuration.clone())
            .unwrap_or(Value::Null)
    }

    fn write_configuration(
        &self,
        plugin_id: &str,
        configuration: Value,
    ) -> Result<(), RuntimeError> {
        let record = self.record(plugin_id)?;

        // Persist and update in-memory state without touching the op mutex:
        // this is reachable from inside a guest call that an in-flight
        // lifecycle operation is waiting on.
        self.persist_locked(&record, None, Some(configuration))?;

        // The restart that surfaces the new config queues behind whatever
        // operation is in flight.
        let registry = self.strong();
        let id = plugin_id.to_string();
        self.handle.spawn(async move {
            let Ok(record) = registry.record(&id) else {
                return;
            };
            let _op = record.op.lock().await;
            let running = {
                let st = record.state.lock().unwrap();
                matches!(st.status, PluginStatus::Running)
            };
            if running {
                registry.stop_locked(&record, StopKind::Suspend).await;
                if let Err(e) = registry.start_locked(&record).await {
                    tracing::error!("Config-triggered restart of '{}' failed: {}", id, e);
                }
            }
        });
        Ok(())
    }

    fn record_status(&self, plugin_id: &str) -> Option<PluginStatus> {
        self.record(plugin_id)
            .ok()
            .map(|record| record.state.lock().unwrap().status)
    }

    fn set_status_message(&self, plugin_id: &str, message: String) {
        if let Ok(record) = self.record(plugin_id) {
            record.state.lock().unwrap().status_message = Some(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(next_backoff_ms(1, 1_000, 30_000), 1_000);
        assert_eq!(next_backoff_ms(2, 1_000, 30_000), 2_000);
        assert_eq!(next_backoff_ms(3, 1_000, 30_000), 4_000);
        assert_eq!(next_backoff_ms(5, 1_000, 30_000), 16_000);
        assert_eq!(next_backoff_ms(6, 1_000, 30_000), 30_000);
        assert_eq!(next_backoff_ms(60, 1_000, 30_000), 30_000);
    }

    #[test]
    fn test_backoff_is_monotone() {
        let mut last = 0;
        for count in 1..40 {
            let backoff = next_backoff_ms(count, 1_000, 30_000);
            assert!(backoff >= last, "backoff shrank at crash #{count}");
            assert!(backoff <= 30_000);
            last = backoff;
        }
    }
}
