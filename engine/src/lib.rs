//! Pelorus Engine Library
//!
//! The sandboxed WebAssembly plugin runtime of a marine telemetry server.
//! This library provides the registry, module runtime, host-call bridge,
//! and HTTP façade; it is used by the daemon binary and integration tests.

/// Runtime settings management module
pub mod config;

/// Per-plugin storage management module
pub mod vfs;

/// Capability gate module
pub mod capabilities;

/// Host services seam consumed from the surrounding server
pub mod host;

/// ServerAPI bridge: host-call implementations
pub mod bridge;

/// Runtime module for loading and tearing down guest modules
pub mod runtime;

/// Subscription management module
pub mod subscriptions;

/// Plugin registry and lifecycle module
pub mod registry;

/// HTTP façade module
pub mod http;

/// Daemon lifecycle management module
pub mod daemon;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;
