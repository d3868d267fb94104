//! In-process units: a Tokio task per extension with only channel ends

use super::{KillSwitch, LaunchSpec, UnitHandle, UnitLauncher};
use crate::extensions::error::RuntimeError;
use crate::extensions::protocol::{HostMessage, UnitMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What an in-process unit gets: its id and its two channel ends
pub struct UnitContext {
    pub extension_id: String,
    pub inbox: mpsc::UnboundedReceiver<HostMessage>,
    pub outbox: mpsc::UnboundedSender<UnitMessage>,
}

impl UnitContext {
    /// Send a message to the host; false once the host side is gone
    pub fn send(&self, message: UnitMessage) -> bool {
        self.outbox.send(message).is_ok()
    }

    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.inbox.recv().await
    }
}

type UnitFactory = Arc<dyn Fn(UnitContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs registered unit bodies as Tokio tasks, keyed by extension id.
///
/// When the body returns, its outbox is dropped and the host treats the unit
/// as exited.
#[derive(Clone, Default)]
pub struct InProcessLauncher {
    factories: Arc<DashMap<String, UnitFactory>>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body to run for `extension_id`
    pub fn register<F, Fut>(&self, extension_id: impl Into<String>, body: F)
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let factory: UnitFactory = Arc::new(move |ctx| body(ctx).boxed());
        self.factories.insert(extension_id.into(), factory);
    }

    pub fn is_registered(&self, extension_id: &str) -> bool {
        self.factories.contains_key(extension_id)
    }
}

#[async_trait]
impl UnitLauncher for InProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<UnitHandle, RuntimeError> {
        let extension_id = spec.extension_id().to_string();
        let factory = self
            .factories
            .get(&extension_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RuntimeError::Launch {
                extension_id: extension_id.clone(),
                message: "no in-process unit registered".to_string(),
            })?;

        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel();
        let ctx = UnitContext {
            extension_id: extension_id.clone(),
            inbox: host_rx,
            outbox: unit_tx,
        };

        let task = tokio::spawn(factory(ctx));
        tracing::debug!(extension = %extension_id, "Started in-process unit");

        Ok(UnitHandle {
            sender: host_tx,
            receiver: unit_rx,
            kill: KillSwitch::Task(task.abort_handle()),
        })
    }
}
