//! extension-runtime: sandboxed host for third-party extensions
//!
//! This library provides:
//! - Isolated extension units (child processes or in-process tasks)
//! - A capability-checked request protocol between host and units
//! - Encrypted, per-extension secrets storage
//! - Per-extension SQLite storage with declared collections
//! - Supervised background tasks with restart policies
//! - CLI commands for managing installed extensions

pub mod cli;
pub mod config;
pub mod extensions;

pub use config::RuntimeConfig;
pub use extensions::{ExtensionRuntime, PermissionChecker, SecretsStore, TaskSupervisor};
