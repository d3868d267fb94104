//! Isolated execution units
//!
//! A unit runs one extension's code and talks to the host only through a
//! pair of message channels. Nothing else is shared: the host never calls
//! into extension code and the extension never touches host state.
//!
//! Two launchers are provided:
//! - [`ProcessLauncher`]: a child process speaking JSON lines over stdio
//! - [`InProcessLauncher`]: a Tokio task that owns only its channel ends

mod in_process;
mod process;

pub use in_process::{InProcessLauncher, UnitContext};
pub use process::ProcessLauncher;

use super::error::RuntimeError;
use super::manifest::ExtensionManifest;
use super::protocol::{HostMessage, UnitMessage};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Everything a launcher needs to start a unit
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub manifest: Arc<ExtensionManifest>,
    /// Directory the manifest was loaded from
    pub extension_dir: PathBuf,
}

impl LaunchSpec {
    pub fn extension_id(&self) -> &str {
        &self.manifest.id
    }
}

/// Force-terminates a unit. Dropping a `Process` switch also kills the process.
#[derive(Debug)]
pub enum KillSwitch {
    Task(AbortHandle),
    Process(oneshot::Sender<()>),
}

impl KillSwitch {
    pub fn kill(self) {
        match self {
            KillSwitch::Task(handle) => handle.abort(),
            KillSwitch::Process(tx) => {
                // the watcher is gone if the process already exited
                let _ = tx.send(());
            }
        }
    }
}

/// Host-side ends of a running unit
#[derive(Debug)]
pub struct UnitHandle {
    pub sender: mpsc::UnboundedSender<HostMessage>,
    pub receiver: mpsc::UnboundedReceiver<UnitMessage>,
    pub kill: KillSwitch,
}

/// Starts units for extensions
#[async_trait]
pub trait UnitLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<UnitHandle, RuntimeError>;
}
