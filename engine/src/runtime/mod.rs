//! Runtime module for loading and tearing down guest modules
//!
//! Turns a compiled module path plus a capability grant into a live,
//! sandboxed [`PluginInstance`], and back.

mod wasm;

pub use wasm::{ModuleRuntime, PluginIdentity, PluginInstance};
