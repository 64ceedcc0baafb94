//! Subscription management
//!
//! Maps plugin `subscribe` calls onto the host telemetry stream. Patterns
//! are dotted paths where `*` matches exactly one segment; they are compiled
//! to a segment list so multi-wildcard, multi-dot patterns match correctly.
//!
//! # Reload buffering
//!
//! Subscriptions outlive the instance that created them: when a plugin is
//! stopping or reloading, its subscriptions are detached and matching deltas
//! accumulate in a bounded FIFO (oldest dropped, one log line per buffering
//! window). When the plugin re-enters `Running`, the buffer is drained in
//! publish order before any new delta is delivered. Subscriptions are only
//! dropped for good when the plugin is unloaded (disabled or uninstalled).
//!
//! # Ordering
//!
//! Deltas delivered to a single subscription arrive in publish order: the
//! bus dispatcher is a single task, deliveries are awaited sequentially, and
//! the drain protocol keeps new deltas queued behind buffered ones until the
//! drain completes. No ordering holds across subscriptions.

use sdk::errors::RuntimeError;
use sdk::types::Delta;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

// ============================================================================
// Pattern matching
// ============================================================================

/// One compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A compiled dotted-path pattern.
///
/// `a.*.c` matches `a.b.c` but not `a.b.x.c`; a literal pattern matches only
/// itself, segment by segment. Empty segments (leading, trailing, or doubled
/// dots) are a compile error, as is an empty pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Compile a pattern. `*` is a single-segment wildcard; `**` is not
    /// supported and is rejected.
    pub fn compile(pattern: &str) -> Result<Self, RuntimeError> {
        if pattern.is_empty() {
            return Err(RuntimeError::InvalidInput("empty pattern".into()));
        }
        let mut segments = Vec::new();
        for raw in pattern.split('.') {
            match raw {
                "" => {
                    return Err(RuntimeError::InvalidInput(format!(
                        "pattern '{pattern}' contains an empty segment"
                    )))
                }
                "*" => segments.push(Segment::Wildcard),
                "**" => {
                    return Err(RuntimeError::InvalidInput(format!(
                        "pattern '{pattern}': '**' is not supported"
                    )))
                }
                lit => segments.push(Segment::Literal(lit.to_string())),
            }
        }
        Ok(Self { segments })
    }

    /// Match a full dotted path against the pattern.
    pub fn matches(&self, path: &str) -> bool {
        let mut parts = path.split('.');
        for segment in &self.segments {
            match (parts.next(), segment) {
                (None, _) => return false,
                (Some(_), Segment::Wildcard) => {}
                (Some(part), Segment::Literal(lit)) => {
                    if part != lit {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// A delta paired with the subscription that matched it, as handed to the
/// guest callback.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeltaEnvelope {
    pub subscription_id: String,
    pub delta: Delta,
}

/// Sink for matched deltas. The runtime's implementation calls the guest's
/// `on_delta` export; tests use an in-memory collector.
#[async_trait::async_trait]
pub trait DeltaSink: Send + Sync {
    async fn deliver(&self, envelope: &DeltaEnvelope) -> Result<(), RuntimeError>;
}

/// A delivery that failed; the caller decides whether it counts as a crash.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub plugin_id: String,
    pub error: RuntimeError,
}

// ============================================================================
// Manager
// ============================================================================

struct Subscription {
    id: String,
    plugin_id: String,
    pattern: PathPattern,
}

enum PluginState {
    /// Instance live; deliver through the sink.
    Active(Arc<dyn DeltaSink>),
    /// Instance gone (stopping, reloading, crashed); buffer matches.
    Buffering {
        buffer: VecDeque<DeltaEnvelope>,
        overflow_logged: bool,
    },
}

struct Inner {
    subscriptions: Vec<Subscription>,
    plugins: HashMap<String, PluginState>,
    next_seq: u64,
}

/// Process-wide subscription manager.
pub struct SubscriptionManager {
    inner: Mutex<Inner>,
    buffer_capacity: usize,
}

impl SubscriptionManager {
    /// `buffer_capacity` bounds the per-plugin reload buffer.
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscriptions: Vec::new(),
                plugins: HashMap::new(),
                next_seq: 1,
            }),
            buffer_capacity,
        }
    }

    /// Register interest in a pattern on behalf of a plugin. The plugin must
    /// have been attached (or detached) beforehand by its lifecycle.
    pub async fn subscribe(
        &self,
        plugin_id: &str,
        pattern: &str,
    ) -> Result<String, RuntimeError> {
        let compiled = PathPattern::compile(pattern)?;
        let mut inner = self.inner.lock().await;
        let id = format!("{plugin_id}-{}", inner.next_seq);
        inner.next_seq += 1;
        inner.subscriptions.push(Subscription {
            id: id.clone(),
            plugin_id: plugin_id.to_string(),
            pattern: compiled,
        });
        Ok(id)
    }

    /// Drop one subscription. Idempotent; a plugin can only drop its own.
    pub async fn unsubscribe(&self, plugin_id: &str, subscription_id: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .subscriptions
            .retain(|s| !(s.id == subscription_id && s.plugin_id == plugin_id));
    }

    /// Number of live subscriptions for a plugin.
    pub async fn subscription_count(&self, plugin_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .subscriptions
            .iter()
            .filter(|s| s.plugin_id == plugin_id)
            .count()
    }

    /// Mark a plugin's instance live and drain anything buffered for it, in
    /// order, before new deltas flow. Called on `Running` entry.
    pub async fn attach(
        &self,
        plugin_id: &str,
        sink: Arc<dyn DeltaSink>,
    ) -> Vec<DeliveryFailure> {
        let mut failures = Vec::new();
        loop {
            // Take one batch under the lock; keep Buffering while draining so
            // concurrent dispatches queue behind the batch instead of
            // overtaking it.
            let batch: Vec<DeltaEnvelope> = {
                let mut inner = self.inner.lock().await;
                let drained = match inner.plugins.get_mut(plugin_id) {
                    Some(PluginState::Buffering { buffer, .. }) if !buffer.is_empty() => {
                        Some(buffer.drain(..).collect())
                    }
                    _ => None,
                };
                match drained {
                    Some(batch) => batch,
                    None => {
                        inner
                            .plugins
                            .insert(plugin_id.to_string(), PluginState::Active(sink.clone()));
                        return failures;
                    }
                }
            };
            for envelope in &batch {
                if let Err(error) = sink.deliver(envelope).await {
                    failures.push(DeliveryFailure {
                        plugin_id: plugin_id.to_string(),
                        error,
                    });
                }
            }
        }
    }

    /// Retain a plugin's subscriptions but buffer matching deltas. Called
    /// when the plugin leaves `Running` for a stop/reload/crash window, and
    /// before the first start to open the buffering window. If the plugin is
    /// already buffering, the accumulated buffer is preserved.
    pub async fn detach(&self, plugin_id: &str) {
        let mut inner = self.inner.lock().await;
        let already_buffering = matches!(
            inner.plugins.get(plugin_id),
            Some(PluginState::Buffering { .. })
        );
        if !already_buffering {
            inner.plugins.insert(
                plugin_id.to_string(),
                PluginState::Buffering {
                    buffer: VecDeque::new(),
                    overflow_logged: false,
                },
            );
        }
    }

    /// Drop all of a plugin's subscriptions and its buffer. Called on unload.
    pub async fn remove_plugin(&self, plugin_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.subscriptions.retain(|s| s.plugin_id != plugin_id);
        inner.plugins.remove(plugin_id);
    }

    /// Dispatch one host delta to every matching subscription.
    ///
    /// Matching is evaluated against each full `context.path` name the delta
    /// carries. Buffered plugins get the envelope queued; active plugins are
    /// delivered sequentially, preserving publish order per subscription.
    pub async fn dispatch(&self, delta: &Delta) -> Vec<DeliveryFailure> {
        let full_paths: Vec<String> = delta.full_paths().collect();

        // Phase 1: under the lock, buffer for detached plugins and collect
        // sinks for active ones. The lock is never held across a guest call.
        let deliveries: Vec<(String, Arc<dyn DeltaSink>, DeltaEnvelope)> = {
            let mut inner = self.inner.lock().await;
            let mut out = Vec::new();
            let matched: Vec<(String, String)> = inner
                .subscriptions
                .iter()
                .filter(|s| full_paths.iter().any(|p| s.pattern.matches(p)))
                .map(|s| (s.plugin_id.clone(), s.id.clone()))
                .collect();
            for (plugin_id, subscription_id) in matched {
                let envelope = DeltaEnvelope {
                    subscription_id,
                    delta: delta.clone(),
                };
                match inner.plugins.get_mut(&plugin_id) {
                    Some(PluginState::Active(sink)) => {
                        out.push((plugin_id.clone(), sink.clone(), envelope))
                    }
                    Some(PluginState::Buffering {
                        buffer,
                        overflow_logged,
                    }) => {
                        if buffer.len() >= self.buffer_capacity {
                            buffer.pop_front();
                            if !*overflow_logged {
                                tracing::warn!(
                                    "Delta buffer for plugin '{}' overflowed; dropping oldest",
                                    plugin_id
                                );
                                *overflow_logged = true;
                            }
                        }
                        buffer.push_back(envelope);
                    }
                    // Plugin was never attached (not registered for
                    // telemetry); subscription is stale, skip.
                    None => {}
                }
            }
            out
        };

        // Phase 2: deliver outside the lock.
        let mut failures = Vec::new();
        for (plugin_id, sink, envelope) in deliveries {
            if let Err(error) = sink.deliver(&envelope).await {
                failures.push(DeliveryFailure { plugin_id, error });
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn delta(context: &str, path: &str) -> Delta {
        Delta {
            context: context.into(),
            source: None,
            timestamp: None,
            values: vec![sdk::types::PathValue {
                path: path.into(),
                value: json!(1),
            }],
        }
    }

    struct CollectingSink {
        seen: StdMutex<Vec<DeltaEnvelope>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn paths(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.delta.values[0].path.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl DeltaSink for CollectingSink {
        async fn deliver(&self, envelope: &DeltaEnvelope) -> Result<(), RuntimeError> {
            self.seen.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    #[test]
    fn test_single_wildcard_matches_one_segment() {
        let p = PathPattern::compile("a.*.c").unwrap();
        assert!(p.matches("a.b.c"));
        assert!(!p.matches("a.b.x.c"));
        assert!(!p.matches("a.c"));
        assert!(!p.matches("a.b.d"));
    }

    #[test]
    fn test_multiple_wildcards() {
        let p = PathPattern::compile("vessels.*.navigation.*").unwrap();
        assert!(p.matches("vessels.self.navigation.position"));
        assert!(p.matches("vessels.urn-mrn-imo-1234.navigation.speedOverGround"));
        assert!(!p.matches("vessels.self.navigation.position.latitude"));
        assert!(!p.matches("vessels.self.environment.depth"));
    }

    #[test]
    fn test_literal_pattern_requires_exact_segments() {
        let p = PathPattern::compile("a.b.c.d").unwrap();
        assert!(p.matches("a.b.c.d"));
        // Dots are separators, not single-character wildcards.
        assert!(!p.matches("aXbYcZd"));
        assert!(!p.matches("a.b.c"));
        assert!(!p.matches("a.b.c.d.e"));
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        for bad in ["", ".a", "a.", "a..b", "a.**.b"] {
            assert!(PathPattern::compile(bad).is_err(), "pattern {bad:?}");
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_active_plugin() {
        let mgr = SubscriptionManager::new(8);
        let sink = CollectingSink::new();
        mgr.attach("nav", sink.clone()).await;
        mgr.subscribe("nav", "vessels.self.navigation.*").await.unwrap();

        mgr.dispatch(&delta("vessels.self", "navigation.position")).await;
        mgr.dispatch(&delta("vessels.self", "environment.depth")).await;

        assert_eq!(sink.paths(), vec!["navigation.position"]);
    }

    #[tokio::test]
    async fn test_buffering_preserves_order_and_drains_on_attach() {
        let mgr = SubscriptionManager::new(8);
        mgr.detach("nav").await;
        mgr.subscribe("nav", "vessels.self.navigation.*").await.unwrap();

        mgr.dispatch(&delta("vessels.self", "navigation.a")).await;
        mgr.dispatch(&delta("vessels.self", "navigation.b")).await;
        mgr.dispatch(&delta("vessels.self", "navigation.c")).await;

        let sink = CollectingSink::new();
        let failures = mgr.attach("nav", sink.clone()).await;
        assert!(failures.is_empty());
        assert_eq!(
            sink.paths(),
            vec!["navigation.a", "navigation.b", "navigation.c"]
        );

        // New deltas flow directly after the drain.
        mgr.dispatch(&delta("vessels.self", "navigation.d")).await;
        assert_eq!(sink.paths().last().unwrap(), "navigation.d");
    }

    #[tokio::test]
    async fn test_buffer_overflow_drops_oldest() {
        let mgr = SubscriptionManager::new(2);
        mgr.detach("nav").await;
        mgr.subscribe("nav", "vessels.self.navigation.*").await.unwrap();

        mgr.dispatch(&delta("vessels.self", "navigation.a")).await;
        mgr.dispatch(&delta("vessels.self", "navigation.b")).await;
        mgr.dispatch(&delta("vessels.self", "navigation.c")).await;

        let sink = CollectingSink::new();
        mgr.attach("nav", sink.clone()).await;
        assert_eq!(sink.paths(), vec!["navigation.b", "navigation.c"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_scoped() {
        let mgr = SubscriptionManager::new(8);
        let sink = CollectingSink::new();
        mgr.attach("nav", sink.clone()).await;
        let id = mgr.subscribe("nav", "vessels.*.navigation.*").await.unwrap();

        // Another plugin cannot drop it.
        mgr.unsubscribe("other", &id).await;
        assert_eq!(mgr.subscription_count("nav").await, 1);

        mgr.unsubscribe("nav", &id).await;
        mgr.unsubscribe("nav", &id).await;
        assert_eq!(mgr.subscription_count("nav").await, 0);
    }

    #[tokio::test]
    async fn test_remove_plugin_drops_subscriptions() {
        let mgr = SubscriptionManager::new(8);
        mgr.detach("nav").await;
        mgr.subscribe("nav", "vessels.self.navigation.*").await.unwrap();
        mgr.remove_plugin("nav").await;
        assert_eq!(mgr.subscription_count("nav").await, 0);

        // Dispatch after removal is a no-op.
        mgr.dispatch(&delta("vessels.self", "navigation.a")).await;
    }
}
