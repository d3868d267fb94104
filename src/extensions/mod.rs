//! Extension runtime
//!
//! Loads third-party extensions into isolated units and mediates everything
//! they do through a capability-checked request protocol.
//!
//! # Architecture
//!
//! Each extension runs in its own unit (a child process or an in-process
//! task) and talks to the host only through messages. Every effectful
//! request (network, storage, secrets, scheduling, chat) is authorized by
//! the extension's [`PermissionChecker`] before the host performs it.
//!
//! # Components
//!
//! - **Permission checker**: pure decisions over declared permissions
//! - **Secrets store**: encrypted values scoped by extension and user
//! - **Task supervisor**: restart policies with exponential backoff
//! - **Runtime**: unit lifecycle, dispatch, streaming calls, timeouts
//!
//! # Security
//!
//! Extensions declare permissions and storage collections in
//! `extension.toml`. Nothing undeclared is granted, and collection access
//! requires the collection to be declared.

pub mod collaborators;
pub mod error;
pub mod manifest;
pub mod permissions;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod secrets;
pub mod sql;
pub mod storage;
pub mod tasks;
pub mod unit;

pub use collaborators::{
    ChatSink, Collaborators, DatabaseExecutor, JobFireResult, ScheduledJob, Scheduler,
    UserDirectory,
};
pub use error::{Denial, ManifestError, RuntimeError, RuntimeResult, SecretsError, StorageError};
pub use manifest::ExtensionManifest;
pub use permissions::PermissionChecker;
pub use protocol::{ExtensionRequest, HostMessage, StreamEvent, UnitMessage};
pub use registry::{ExtensionRegistry, InstalledExtension};
pub use runtime::{
    ActionDescriptor, ChatStream, ExtensionRuntime, ExtensionRuntimeBuilder, ExtensionStatus,
    LoadedExtension, ProviderDescriptor, PurgeReport, RuntimeEvent, ToolDescriptor,
};
pub use secrets::SecretsStore;
pub use tasks::{
    BackgroundTask, RestartMode, RestartPolicy, TaskControl, TaskEvent, TaskRegistration,
    TaskReport, TaskStatus, TaskSupervisor,
};
pub use unit::{InProcessLauncher, ProcessLauncher, UnitContext, UnitLauncher};

use anyhow::Result;
use std::path::PathBuf;

fn base_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    Ok(data_dir.join("extension-runtime"))
}

/// Get the default extensions directory path
pub fn extensions_dir() -> Result<PathBuf> {
    Ok(base_data_dir()?.join("extensions"))
}

/// Get the default directory for extension storage and secrets
pub fn data_dir() -> Result<PathBuf> {
    Ok(base_data_dir()?.join("data"))
}
