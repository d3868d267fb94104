//! Extension lifecycle manager
//!
//! Owns every loaded extension: starts its unit, activates it once the unit
//! reports ready, pumps its messages, dispatches its requests and tears it
//! down again. Providers, tools, actions, background tasks and pending calls
//! are all tracked per extension so an unload leaves nothing behind.

mod contributions;
mod dispatch;
mod pending;

pub use contributions::{
    ActionDescriptor, ContributionRegistry, ProviderDescriptor, RemovedContributions,
    ToolDescriptor,
};
pub use pending::PendingRequests;

use super::collaborators::Collaborators;
use super::error::{RuntimeError, RuntimeResult};
use super::manifest::ExtensionManifest;
use super::permissions::PermissionChecker;
use super::protocol::{HostMessage, StreamEvent, UnitMessage};
use super::registry::ExtensionRegistry;
use super::secrets::SecretsStore;
use super::storage::StorageManager;
use super::tasks::{BackgroundTask, TaskControl, TaskEvent, TaskSupervisor};
use super::unit::{KillSwitch, LaunchSpec, ProcessLauncher, UnitLauncher};
use crate::config::RuntimeConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionStatus {
    Loading,
    Active,
    Error,
    Disabled,
}

impl std::fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExtensionStatus::Loading => "loading",
            ExtensionStatus::Active => "active",
            ExtensionStatus::Error => "error",
            ExtensionStatus::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of a loaded extension
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedExtension {
    pub id: String,
    pub version: String,
    pub name: String,
    pub path: PathBuf,
    pub status: ExtensionStatus,
    pub error: Option<String>,
    pub permissions: Vec<String>,
    pub settings: Map<String, Value>,
    pub providers: Vec<String>,
    pub tools: Vec<String>,
}

/// Runtime lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuntimeEvent {
    #[serde(rename_all = "camelCase")]
    ExtensionActivated { extension_id: String, version: String },
    #[serde(rename_all = "camelCase")]
    ExtensionUnloaded { extension_id: String },
    #[serde(rename_all = "camelCase")]
    ExtensionError { extension_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    ProviderRegistered {
        extension_id: String,
        provider_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ProviderUnregistered {
        extension_id: String,
        provider_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolRegistered { extension_id: String, tool_id: String },
    #[serde(rename_all = "camelCase")]
    ToolUnregistered { extension_id: String, tool_id: String },
    #[serde(rename_all = "camelCase")]
    SettingsChanged { extension_id: String, key: String },
}

/// Runtime-side state of one extension
struct ExtensionRecord {
    manifest: Arc<ExtensionManifest>,
    path: PathBuf,
    status: ExtensionStatus,
    error: Option<String>,
    checker: Arc<PermissionChecker>,
    settings: Map<String, Value>,
    kill: Option<KillSwitch>,
    pump: Option<JoinHandle<()>>,
    unloading: bool,
}

impl ExtensionRecord {
    fn new(manifest: ExtensionManifest, path: PathBuf, status: ExtensionStatus) -> Self {
        let checker = Arc::new(PermissionChecker::from_manifest(&manifest));
        let settings = manifest.default_settings();
        Self {
            manifest: Arc::new(manifest),
            path,
            status,
            error: None,
            checker,
            settings,
            kill: None,
            pump: None,
            unloading: false,
        }
    }
}

type UnitSenders = Arc<DashMap<String, mpsc::UnboundedSender<HostMessage>>>;

/// Starts and stops background tasks by messaging the owning unit
struct UnitTaskControl {
    units: UnitSenders,
}

impl TaskControl for UnitTaskControl {
    fn start(&self, extension_id: &str, task_id: &str) -> Result<(), String> {
        let sender = self
            .units
            .get(extension_id)
            .ok_or_else(|| format!("extension {} has no running unit", extension_id))?;
        sender
            .send(HostMessage::TaskStart {
                task_id: task_id.to_string(),
            })
            .map_err(|_| format!("unit for {} is gone", extension_id))
    }

    fn stop(&self, extension_id: &str, task_id: &str) {
        if let Some(sender) = self.units.get(extension_id) {
            let _ = sender.send(HostMessage::TaskStop {
                task_id: task_id.to_string(),
            });
        }
    }
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    launcher: Arc<dyn UnitLauncher>,
    extensions: DashMap<String, ExtensionRecord>,
    units: UnitSenders,
    pending: PendingRequests,
    contributions: ContributionRegistry,
    supervisor: TaskSupervisor,
    secrets: Option<Arc<SecretsStore>>,
    storage: StorageManager,
    collaborators: Collaborators,
    http: reqwest::Client,
    events: broadcast::Sender<RuntimeEvent>,
}

impl RuntimeInner {
    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    fn checker(&self, extension_id: &str) -> Option<Arc<PermissionChecker>> {
        self.extensions
            .get(extension_id)
            .filter(|record| record.status == ExtensionStatus::Active && !record.unloading)
            .map(|record| Arc::clone(&record.checker))
    }

    fn settings(&self, extension_id: &str) -> RuntimeResult<Map<String, Value>> {
        self.extensions
            .get(extension_id)
            .map(|record| record.settings.clone())
            .ok_or_else(|| RuntimeError::NotLoaded(extension_id.to_string()))
    }

    /// Update a declared setting in the record
    fn store_setting(&self, extension_id: &str, key: &str, value: Value) -> RuntimeResult<()> {
        let mut record = self
            .extensions
            .get_mut(extension_id)
            .ok_or_else(|| RuntimeError::NotLoaded(extension_id.to_string()))?;
        if !record.manifest.declares_setting(key) {
            return Err(RuntimeError::UnknownSetting {
                extension_id: extension_id.to_string(),
                key: key.to_string(),
            });
        }
        record.settings.insert(key.to_string(), value);
        Ok(())
    }

    fn secrets(&self) -> RuntimeResult<Arc<SecretsStore>> {
        self.secrets
            .clone()
            .ok_or(RuntimeError::CollaboratorUnavailable("secrets store"))
    }

    fn send_to_unit(&self, extension_id: &str, message: HostMessage) -> RuntimeResult<()> {
        let sender = self
            .units
            .get(extension_id)
            .ok_or_else(|| RuntimeError::NotActive(extension_id.to_string()))?;
        sender
            .send(message)
            .map_err(|_| RuntimeError::ChannelClosed(extension_id.to_string()))
    }

    fn set_status(&self, extension_id: &str, status: ExtensionStatus, error: Option<String>) {
        if let Some(mut record) = self.extensions.get_mut(extension_id) {
            record.status = status;
            record.error = error;
        }
    }

    /// Remove everything an extension registered, announcing each removal
    fn remove_contributions(&self, extension_id: &str) -> RemovedContributions {
        let removed = self.contributions.unregister_extension(extension_id);
        for provider_id in &removed.providers {
            self.emit(RuntimeEvent::ProviderUnregistered {
                extension_id: extension_id.to_string(),
                provider_id: provider_id.clone(),
            });
        }
        for tool_id in &removed.tools {
            self.emit(RuntimeEvent::ToolUnregistered {
                extension_id: extension_id.to_string(),
                tool_id: tool_id.clone(),
            });
        }
        removed
    }

    fn snapshot(&self, extension_id: &str) -> Option<LoadedExtension> {
        let record = self.extensions.get(extension_id)?;
        let (providers, tools) = self.contributions.owned_by(extension_id);
        Some(LoadedExtension {
            id: extension_id.to_string(),
            version: record.manifest.version.clone(),
            name: record.manifest.display_name().to_string(),
            path: record.path.clone(),
            status: record.status,
            error: record.error.clone(),
            permissions: record.checker.permissions(),
            settings: record.settings.clone(),
            providers,
            tools,
        })
    }

    /// Run `register` while holding the extension's record, so it cannot
    /// interleave with `unload` marking the record. `None` when the
    /// extension is not active. `register` must not touch `extensions`.
    fn while_accepting<T>(
        &self,
        extension_id: &str,
        register: impl FnOnce(&PermissionChecker) -> T,
    ) -> Option<T> {
        let record = self.extensions.get(extension_id)?;
        if record.status != ExtensionStatus::Active || record.unloading {
            return None;
        }
        Some(register(&record.checker))
    }

    fn is_accepting(&self, extension_id: &str) -> bool {
        self.extensions
            .get(extension_id)
            .map(|record| record.status == ExtensionStatus::Active && !record.unloading)
            .unwrap_or(false)
    }

    /// The unit went away without being asked to
    fn handle_unit_exit(&self, extension_id: &str) {
        let unloading = self
            .extensions
            .get(extension_id)
            .map(|record| record.unloading)
            .unwrap_or(true);
        if unloading {
            return;
        }

        let message = RuntimeError::UnitCrashed(extension_id.to_string()).to_string();
        tracing::error!(extension = extension_id, "{}", message);

        self.units.remove(extension_id);
        let id = extension_id.to_string();
        self.pending
            .reject_extension(extension_id, || RuntimeError::UnitCrashed(id.clone()));
        self.remove_contributions(extension_id);
        self.supervisor.unregister_extension(extension_id);

        if let Some(mut record) = self.extensions.get_mut(extension_id) {
            record.status = ExtensionStatus::Error;
            record.error = Some(message.clone());
            record.kill = None;
            record.pump = None;
        }
        self.emit(RuntimeEvent::ExtensionError {
            extension_id: extension_id.to_string(),
            error: message,
        });
    }
}

/// Handle one message from a unit
fn handle_unit_message(inner: &Arc<RuntimeInner>, extension_id: &str, message: UnitMessage) {
    tracing::debug!(extension = extension_id, kind = message.kind(), "Unit message");

    match message {
        UnitMessage::Ready => {
            tracing::debug!(extension = extension_id, "Ignoring repeated ready");
        }
        UnitMessage::Request {
            id,
            method,
            payload,
        } => {
            let inner = Arc::clone(inner);
            let extension_id = extension_id.to_string();
            tokio::spawn(async move {
                let response =
                    dispatch::handle_request(&inner, &extension_id, id, method, payload).await;
                if let Err(err) = inner.send_to_unit(&extension_id, response) {
                    tracing::debug!(extension = %extension_id, error = %err, "Dropping response");
                }
            });
        }
        UnitMessage::ProviderRegistered { id, name } => {
            inner.while_accepting(extension_id, |checker| {
                if let Err(denial) = checker.check_provider_registration() {
                    tracing::warn!(extension = extension_id, provider = %id, "{}", denial);
                    return;
                }
                let descriptor = ProviderDescriptor {
                    extension_id: extension_id.to_string(),
                    id: id.clone(),
                    name: if name.is_empty() { id.clone() } else { name },
                };
                match inner.contributions.register_provider(descriptor) {
                    Ok(()) => {
                        tracing::info!(extension = extension_id, provider = %id, "Provider registered");
                        inner.emit(RuntimeEvent::ProviderRegistered {
                            extension_id: extension_id.to_string(),
                            provider_id: id,
                        });
                    }
                    Err(reason) => tracing::warn!(extension = extension_id, "{}", reason),
                }
            });
        }
        UnitMessage::ProviderUnregistered { id } => {
            if inner.contributions.unregister_provider(extension_id, &id) {
                inner.emit(RuntimeEvent::ProviderUnregistered {
                    extension_id: extension_id.to_string(),
                    provider_id: id,
                });
            }
        }
        UnitMessage::ToolRegistered {
            id,
            name,
            description,
            parameters,
        } => {
            inner.while_accepting(extension_id, |checker| {
                if let Err(denial) = checker.check_tool_registration() {
                    tracing::warn!(extension = extension_id, tool = %id, "{}", denial);
                    return;
                }
                let descriptor = ToolDescriptor {
                    extension_id: extension_id.to_string(),
                    id: id.clone(),
                    name: if name.is_empty() { id.clone() } else { name },
                    description,
                    parameters,
                };
                match inner.contributions.register_tool(descriptor) {
                    Ok(()) => {
                        tracing::info!(extension = extension_id, tool = %id, "Tool registered");
                        inner.emit(RuntimeEvent::ToolRegistered {
                            extension_id: extension_id.to_string(),
                            tool_id: id,
                        });
                    }
                    Err(reason) => tracing::warn!(extension = extension_id, "{}", reason),
                }
            });
        }
        UnitMessage::ToolUnregistered { id } => {
            if inner.contributions.unregister_tool(extension_id, &id) {
                inner.emit(RuntimeEvent::ToolUnregistered {
                    extension_id: extension_id.to_string(),
                    tool_id: id,
                });
            }
        }
        UnitMessage::ActionRegistered { id, name } => {
            inner.while_accepting(extension_id, |checker| {
                if let Err(denial) = checker.check_action_registration() {
                    tracing::warn!(extension = extension_id, action = %id, "{}", denial);
                    return;
                }
                inner.contributions.register_action(ActionDescriptor {
                    extension_id: extension_id.to_string(),
                    name: if name.is_empty() { id.clone() } else { name },
                    id,
                });
            });
        }
        UnitMessage::Log {
            level,
            message,
            context,
        } => forward_log(extension_id, &level, &message, context.as_ref()),
        UnitMessage::StreamEvent { request_id, event } => {
            if !inner.pending.push_event(extension_id, &request_id, event) {
                tracing::debug!(extension = extension_id, request = %request_id, "Stream event for unknown request");
            }
        }
        UnitMessage::ProviderChatResponse(reply)
        | UnitMessage::ProviderModelsResponse(reply)
        | UnitMessage::ToolExecuteResponse(reply)
        | UnitMessage::ActionExecuteResponse(reply) => {
            let request_id = reply.request_id.clone();
            inner
                .pending
                .resolve(extension_id, &request_id, reply.into_result());
        }
    }
}

fn forward_log(extension_id: &str, level: &str, message: &str, context: Option<&Value>) {
    let context = context.map(|c| c.to_string()).unwrap_or_default();
    match level.to_ascii_lowercase().as_str() {
        "error" => tracing::error!(extension = extension_id, %context, "[ext] {}", message),
        "warn" | "warning" => tracing::warn!(extension = extension_id, %context, "[ext] {}", message),
        "debug" => tracing::debug!(extension = extension_id, %context, "[ext] {}", message),
        "trace" => tracing::trace!(extension = extension_id, %context, "[ext] {}", message),
        _ => tracing::info!(extension = extension_id, %context, "[ext] {}", message),
    }
}

/// Drain a unit's messages until it closes its side
async fn pump(
    inner: Weak<RuntimeInner>,
    extension_id: String,
    early: Vec<UnitMessage>,
    mut receiver: mpsc::UnboundedReceiver<UnitMessage>,
) {
    for message in early {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        handle_unit_message(&inner, &extension_id, message);
    }

    while let Some(message) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        handle_unit_message(&inner, &extension_id, message);
    }

    if let Some(inner) = inner.upgrade() {
        inner.handle_unit_exit(&extension_id);
    }
}

/// Events of one streaming provider call, in emission order
pub struct ChatStream {
    request_id: String,
    receiver: mpsc::UnboundedReceiver<StreamEvent>,
    pending: PendingRequests,
    finished: bool,
}

impl ChatStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next event; `None` after `done`/`error`
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        match self.receiver.recv().await {
            Some(event) => {
                self.finished = event.is_terminal();
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Drain the stream, terminal event included
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.finished {
            self.pending.cancel(&self.request_id);
        }
    }
}

/// What `purge` removed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub was_loaded: bool,
    pub secrets_removed: usize,
}

/// Builder for [`ExtensionRuntime`]
#[derive(Default)]
pub struct ExtensionRuntimeBuilder {
    config: RuntimeConfig,
    launcher: Option<Arc<dyn UnitLauncher>>,
    secrets: Option<Arc<SecretsStore>>,
    collaborators: Collaborators,
    storage_root: Option<PathBuf>,
}

impl ExtensionRuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// How units are started (child processes by default)
    pub fn launcher(mut self, launcher: Arc<dyn UnitLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn secrets(mut self, secrets: Arc<SecretsStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Override where extension storage files go
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn build(self) -> RuntimeResult<ExtensionRuntime> {
        let storage_root = match self.storage_root {
            Some(root) => root,
            None => self.config.storage_dir()?,
        };

        let http = reqwest::Client::builder()
            .user_agent(self.config.network.user_agent.clone())
            .timeout(Duration::from_secs(self.config.network.timeout_secs))
            // every hop must pass the network permission check
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        let units: UnitSenders = Arc::new(DashMap::new());
        let supervisor = TaskSupervisor::new(Arc::new(UnitTaskControl {
            units: Arc::clone(&units),
        }));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(ExtensionRuntime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                launcher: self
                    .launcher
                    .unwrap_or_else(|| Arc::new(ProcessLauncher::new()) as Arc<dyn UnitLauncher>),
                extensions: DashMap::new(),
                units,
                pending: PendingRequests::new(),
                contributions: ContributionRegistry::new(),
                supervisor,
                secrets: self.secrets,
                storage: StorageManager::new(storage_root),
                collaborators: self.collaborators,
                http,
                events,
            }),
        })
    }
}

/// The extension runtime. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ExtensionRuntime {
    inner: Arc<RuntimeInner>,
}

impl ExtensionRuntime {
    pub fn builder() -> ExtensionRuntimeBuilder {
        ExtensionRuntimeBuilder::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    /// Background task lifecycle events
    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.supervisor.subscribe()
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.inner.supervisor
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Validate a manifest, start its unit and activate it once ready.
    ///
    /// Validation, launch and readiness failures do not return `Err`; they
    /// produce a record with status `error`. `Err` means the id is already
    /// loading or active.
    pub async fn load(
        &self,
        manifest: ExtensionManifest,
        path: impl Into<PathBuf>,
    ) -> RuntimeResult<LoadedExtension> {
        let path = path.into();
        let id = manifest.id.clone();
        let validation = manifest.validate();

        let mut record = ExtensionRecord::new(manifest, path.clone(), ExtensionStatus::Loading);
        if let Err(err) = &validation {
            record.status = ExtensionStatus::Error;
            record.error = Some(err.to_string());
        }
        let manifest = Arc::clone(&record.manifest);

        match self.inner.extensions.entry(id.clone()) {
            Entry::Occupied(existing)
                if matches!(
                    existing.get().status,
                    ExtensionStatus::Loading | ExtensionStatus::Active
                ) =>
            {
                return Err(RuntimeError::AlreadyLoaded(id));
            }
            Entry::Occupied(mut existing) => {
                existing.insert(record);
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }

        if let Err(err) = validation {
            tracing::warn!(extension = %id, error = %err, "Invalid extension manifest");
            self.inner.emit(RuntimeEvent::ExtensionError {
                extension_id: id.clone(),
                error: err.to_string(),
            });
            return self.snapshot_or_missing(&id);
        }

        let spec = LaunchSpec {
            manifest: Arc::clone(&manifest),
            extension_dir: path,
        };
        let mut handle = match self.inner.launcher.launch(&spec).await {
            Ok(handle) => handle,
            Err(err) => return self.fail_load(&id, err.to_string()),
        };

        let mut early = Vec::new();
        let ready = tokio::time::timeout(self.inner.config.ready_timeout(), async {
            loop {
                match handle.receiver.recv().await {
                    Some(UnitMessage::Ready) => return true,
                    Some(other) => early.push(other),
                    None => return false,
                }
            }
        })
        .await;

        match ready {
            Ok(true) => {}
            Ok(false) => {
                return self.fail_load(&id, "unit exited before reporting ready".to_string());
            }
            Err(_) => {
                handle.kill.kill();
                return self.fail_load(
                    &id,
                    format!(
                        "unit did not report ready within {}s",
                        self.inner.config.ready_timeout().as_secs()
                    ),
                );
            }
        }

        let storage_dir = match self.inner.storage.extension_dir(&id) {
            Ok(dir) => dir,
            Err(err) => {
                handle.kill.kill();
                return self.fail_load(&id, err.to_string());
            }
        };
        let settings = self.inner.settings(&id)?;
        let activate = HostMessage::Activate {
            extension_id: id.clone(),
            version: manifest.version.clone(),
            storage_path: storage_dir.display().to_string(),
            permissions: manifest.permissions.clone(),
            settings,
        };
        if handle.sender.send(activate).is_err() {
            handle.kill.kill();
            return self.fail_load(&id, "unit closed its channel before activation".to_string());
        }

        self.inner.units.insert(id.clone(), handle.sender);
        if let Some(mut record) = self.inner.extensions.get_mut(&id) {
            record.status = ExtensionStatus::Active;
            record.kill = Some(handle.kill);
        }
        tracing::info!(extension = %id, version = %manifest.version, "Extension activated");
        self.inner.emit(RuntimeEvent::ExtensionActivated {
            extension_id: id.clone(),
            version: manifest.version.clone(),
        });

        let pump_task = tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            id.clone(),
            early,
            handle.receiver,
        ));
        if let Some(mut record) = self.inner.extensions.get_mut(&id) {
            if record.status == ExtensionStatus::Active {
                record.pump = Some(pump_task);
            }
        }

        self.snapshot_or_missing(&id)
    }

    /// Read and load the manifest found in `dir`
    pub async fn load_dir(&self, dir: &Path) -> RuntimeResult<LoadedExtension> {
        let manifest = ExtensionManifest::load_from_dir(dir)?;
        self.load(manifest, dir).await
    }

    /// Load every enabled extension of a registry; disabled ones are recorded as such
    pub async fn load_enabled(&self, registry: &ExtensionRegistry) -> Vec<LoadedExtension> {
        let mut loaded = Vec::new();
        for installed in registry.all() {
            if !installed.enabled {
                let record = ExtensionRecord::new(
                    installed.manifest.clone(),
                    installed.path.clone(),
                    ExtensionStatus::Disabled,
                );
                self.inner
                    .extensions
                    .entry(installed.id().to_string())
                    .or_insert(record);
                if let Some(snapshot) = self.inner.snapshot(installed.id()) {
                    loaded.push(snapshot);
                }
                continue;
            }

            match self
                .load(installed.manifest.clone(), installed.path.clone())
                .await
            {
                Ok(snapshot) => loaded.push(snapshot),
                Err(err) => tracing::warn!(extension = %installed.id(), error = %err, "Skipping extension"),
            }
        }
        loaded
    }

    fn fail_load(&self, id: &str, message: String) -> RuntimeResult<LoadedExtension> {
        tracing::error!(extension = id, error = %message, "Failed to load extension");
        self.inner
            .set_status(id, ExtensionStatus::Error, Some(message.clone()));
        self.inner.emit(RuntimeEvent::ExtensionError {
            extension_id: id.to_string(),
            error: message,
        });
        self.snapshot_or_missing(id)
    }

    fn snapshot_or_missing(&self, id: &str) -> RuntimeResult<LoadedExtension> {
        self.inner
            .snapshot(id)
            .ok_or_else(|| RuntimeError::NotLoaded(id.to_string()))
    }

    /// Unregister everything, deactivate the unit, force-terminate it after
    /// the grace period and forget the extension.
    pub async fn unload(&self, id: &str) -> RuntimeResult<()> {
        let (kill, pump_task) = {
            let mut record = self
                .inner
                .extensions
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotLoaded(id.to_string()))?;
            record.unloading = true;
            (record.kill.take(), record.pump.take())
        };

        // no task can be started once the sender is gone
        let sender = self.inner.units.remove(id).map(|(_, sender)| sender);
        let removed = self.inner.remove_contributions(id);
        let tasks = self.inner.supervisor.unregister_extension(id);
        let owned = id.to_string();
        let rejected = self
            .inner
            .pending
            .reject_extension(id, || RuntimeError::Unloaded(owned.clone()));

        if let Some(sender) = sender {
            let _ = sender.send(HostMessage::Deactivate);
        }

        if let Some(mut pump_task) = pump_task {
            let grace = self.inner.config.deactivate_grace();
            if tokio::time::timeout(grace, &mut pump_task).await.is_err() {
                tracing::warn!(extension = id, "Unit did not exit within grace period, terminating");
                pump_task.abort();
            }
        }
        if let Some(kill) = kill {
            kill.kill();
        }

        self.inner.extensions.remove(id);
        self.inner.storage.close_extension(id);

        tracing::info!(
            extension = id,
            providers = removed.providers.len(),
            tools = removed.tools.len(),
            tasks,
            rejected,
            "Extension unloaded"
        );
        self.inner.emit(RuntimeEvent::ExtensionUnloaded {
            extension_id: id.to_string(),
        });
        Ok(())
    }

    /// Unload every extension
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .inner
            .extensions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Err(err) = self.unload(&id).await {
                tracing::debug!(extension = %id, error = %err, "Unload during shutdown failed");
            }
        }
    }

    /// Unload (if loaded) and delete all secrets and storage of an extension
    pub async fn purge(&self, id: &str) -> RuntimeResult<PurgeReport> {
        // rejects ids that are not plain path segments before touching anything
        self.inner.storage.extension_dir(id)?;
        let was_loaded = self.inner.extensions.contains_key(id);
        if was_loaded {
            self.unload(id).await?;
        }
        let secrets_removed = match &self.inner.secrets {
            Some(secrets) => secrets.delete_all_for_extension(id)?,
            None => 0,
        };
        self.inner.storage.purge_extension(id)?;
        tracing::info!(extension = id, secrets_removed, "Extension purged");
        Ok(PurgeReport {
            was_loaded,
            secrets_removed,
        })
    }

    /// Change a declared setting from the host side and notify the unit
    pub fn set_setting(&self, id: &str, key: &str, value: Value) -> RuntimeResult<()> {
        if !self.inner.is_accepting(id) {
            return Err(RuntimeError::NotActive(id.to_string()));
        }
        self.inner.store_setting(id, key, value.clone())?;
        self.inner.send_to_unit(
            id,
            HostMessage::SettingsChanged {
                key: key.to_string(),
                value,
            },
        )?;
        self.inner.emit(RuntimeEvent::SettingsChanged {
            extension_id: id.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    async fn call(
        &self,
        extension_id: &str,
        timeout: Duration,
        build: impl FnOnce(String) -> HostMessage,
    ) -> RuntimeResult<Value> {
        if !self.inner.is_accepting(extension_id) {
            return Err(RuntimeError::NotActive(extension_id.to_string()));
        }
        let (request_id, reply) = self.inner.pending.register(extension_id, timeout);
        if let Err(err) = self.inner.send_to_unit(extension_id, build(request_id.clone())) {
            self.inner.pending.cancel(&request_id);
            return Err(err);
        }
        await_reply(extension_id, reply).await
    }

    /// Run a registered tool (60s timeout by default)
    pub async fn execute_tool(
        &self,
        tool_id: &str,
        arguments: Value,
        user_id: Option<String>,
    ) -> RuntimeResult<Value> {
        let tool = self
            .inner
            .contributions
            .tool(tool_id)
            .ok_or_else(|| RuntimeError::UnknownContribution {
                kind: "tool",
                id: tool_id.to_string(),
            })?;
        let tool_id = tool_id.to_string();
        self.call(&tool.extension_id, self.inner.config.tool_timeout(), |request_id| {
            HostMessage::ToolExecuteRequest {
                request_id,
                tool_id,
                arguments,
                user_id,
            }
        })
        .await
    }

    /// Run an action of an extension (30s timeout by default)
    pub async fn execute_action(
        &self,
        extension_id: &str,
        action_id: &str,
        payload: Value,
    ) -> RuntimeResult<Value> {
        if self.inner.contributions.action(extension_id, action_id).is_none() {
            return Err(RuntimeError::UnknownContribution {
                kind: "action",
                id: action_id.to_string(),
            });
        }
        let action_id = action_id.to_string();
        self.call(extension_id, self.inner.config.action_timeout(), |request_id| {
            HostMessage::ActionExecuteRequest {
                request_id,
                action_id,
                payload,
            }
        })
        .await
    }

    /// Ask a provider for its models (30s timeout by default)
    pub async fn list_models(&self, provider_id: &str) -> RuntimeResult<Value> {
        let provider = self.provider_descriptor(provider_id)?;
        let provider_id = provider_id.to_string();
        self.call(
            &provider.extension_id,
            self.inner.config.models_timeout(),
            |request_id| HostMessage::ProviderModelsRequest {
                request_id,
                provider_id,
            },
        )
        .await
    }

    /// Start a streaming chat call against a provider
    pub fn chat(&self, provider_id: &str, payload: Value) -> RuntimeResult<ChatStream> {
        let provider = self.provider_descriptor(provider_id)?;
        let extension_id = provider.extension_id;
        if !self.inner.is_accepting(&extension_id) {
            return Err(RuntimeError::NotActive(extension_id));
        }

        let (request_id, receiver) = self.inner.pending.register_stream(&extension_id);
        let request = HostMessage::ProviderChatRequest {
            request_id: request_id.clone(),
            provider_id: provider_id.to_string(),
            payload,
        };
        if let Err(err) = self.inner.send_to_unit(&extension_id, request) {
            self.inner.pending.cancel(&request_id);
            return Err(err);
        }

        Ok(ChatStream {
            request_id,
            receiver,
            pending: self.inner.pending.clone(),
            finished: false,
        })
    }

    fn provider_descriptor(&self, provider_id: &str) -> RuntimeResult<ProviderDescriptor> {
        self.inner
            .contributions
            .provider(provider_id)
            .ok_or_else(|| RuntimeError::UnknownContribution {
                kind: "provider",
                id: provider_id.to_string(),
            })
    }

    /// Stop a background task from the host side
    pub fn stop_task(&self, extension_id: &str, task_id: &str) -> RuntimeResult<()> {
        self.inner.supervisor.stop_task(extension_id, task_id)
    }

    pub fn status(&self, id: &str) -> Option<LoadedExtension> {
        self.inner.snapshot(id)
    }

    /// All known extensions, ordered by id
    pub fn list(&self) -> Vec<LoadedExtension> {
        let mut ids: Vec<String> = self
            .inner
            .extensions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids.iter().filter_map(|id| self.inner.snapshot(id)).collect()
    }

    pub fn providers(&self) -> Vec<ProviderDescriptor> {
        self.inner.contributions.providers()
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner.contributions.tools()
    }

    pub fn actions(&self) -> Vec<ActionDescriptor> {
        self.inner.contributions.actions()
    }

    pub fn tasks(&self) -> Vec<BackgroundTask> {
        self.inner.supervisor.list()
    }

    /// Calls still waiting on a unit
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

async fn await_reply(
    extension_id: &str,
    reply: oneshot::Receiver<pending::Reply>,
) -> RuntimeResult<Value> {
    reply
        .await
        .map_err(|_| RuntimeError::ChannelClosed(extension_id.to_string()))?
}
