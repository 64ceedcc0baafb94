//! CLI interface for Pelorus
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for controlling the runtime.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pelorus plugin runtime
///
/// Hosts sandboxed WebAssembly extensions for a marine telemetry server:
/// isolated per-plugin storage, capability-gated host calls, hot reload,
/// and crash supervision.
#[derive(Parser, Debug)]
#[command(name = "pelorus")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate settings file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the runtime in the foreground
    Start,

    /// List installed plugin packages without starting anything
    Plugins,
}
