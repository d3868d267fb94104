//! Host ⇄ unit message protocol
//!
//! Every message is a `type`-tagged object. Over a process pipe it travels as
//! one JSON document per line; in-process units exchange the enum values
//! directly.
//!
//! Requests a unit sends carry a method name and a free-form payload. They
//! are parsed into [`ExtensionRequest`] before any permission check, so
//! dispatch is an exhaustive match over known methods.

use super::collaborators::{JobFireResult, ScheduledJob};
use super::error::RuntimeError;
use super::tasks::{TaskRegistration, TaskReport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Messages sent from the host to a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    #[serde(rename_all = "camelCase")]
    Activate {
        extension_id: String,
        version: String,
        storage_path: String,
        permissions: Vec<String>,
        settings: Map<String, Value>,
    },
    Deactivate,
    SettingsChanged {
        key: String,
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ProviderChatRequest {
        request_id: String,
        provider_id: String,
        payload: Value,
    },
    #[serde(rename_all = "camelCase")]
    ProviderModelsRequest {
        request_id: String,
        provider_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecuteRequest {
        request_id: String,
        tool_id: String,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ActionExecuteRequest {
        request_id: String,
        action_id: String,
        payload: Value,
    },
    #[serde(rename_all = "camelCase")]
    TaskStart { task_id: String },
    #[serde(rename_all = "camelCase")]
    TaskStop { task_id: String },
}

impl HostMessage {
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        HostMessage::Response {
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        HostMessage::Response {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Reply to a host-issued call (tool, action, models, chat)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitReply {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl UnitReply {
    pub fn into_result(self) -> Result<Value, String> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "extension reported failure".to_string()))
        }
    }
}

/// Messages sent from a unit to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UnitMessage {
    Ready,
    Request {
        id: String,
        method: String,
        #[serde(default)]
        payload: Value,
    },
    ProviderRegistered {
        id: String,
        #[serde(default)]
        name: String,
    },
    ProviderUnregistered {
        id: String,
    },
    ToolRegistered {
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        parameters: Value,
    },
    ToolUnregistered {
        id: String,
    },
    ActionRegistered {
        id: String,
        #[serde(default)]
        name: String,
    },
    Log {
        level: String,
        message: String,
        #[serde(default)]
        context: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    StreamEvent {
        request_id: String,
        event: StreamEvent,
    },
    ProviderChatResponse(UnitReply),
    ProviderModelsResponse(UnitReply),
    ToolExecuteResponse(UnitReply),
    ActionExecuteResponse(UnitReply),
}

impl UnitMessage {
    /// Short tag for logs
    pub fn kind(&self) -> &'static str {
        match self {
            UnitMessage::Ready => "ready",
            UnitMessage::Request { .. } => "request",
            UnitMessage::ProviderRegistered { .. } => "provider-registered",
            UnitMessage::ProviderUnregistered { .. } => "provider-unregistered",
            UnitMessage::ToolRegistered { .. } => "tool-registered",
            UnitMessage::ToolUnregistered { .. } => "tool-unregistered",
            UnitMessage::ActionRegistered { .. } => "action-registered",
            UnitMessage::Log { .. } => "log",
            UnitMessage::StreamEvent { .. } => "stream-event",
            UnitMessage::ProviderChatResponse(_) => "provider-chat-response",
            UnitMessage::ProviderModelsResponse(_) => "provider-models-response",
            UnitMessage::ToolExecuteResponse(_) => "tool-execute-response",
            UnitMessage::ActionExecuteResponse(_) => "action-execute-response",
        }
    }
}

/// One event of a streaming call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Incremental text
    Text { text: String },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    #[serde(rename_all = "camelCase")]
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Anything else a provider wants to forward
    Data { data: Value },
    Done,
    Error { message: String },
}

impl StreamEvent {
    /// `done` and `error` close a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}

/// Payload of `network.fetch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// A request a unit sends to the host, parsed from method + payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", content = "payload")]
pub enum ExtensionRequest {
    #[serde(rename = "network.fetch")]
    NetworkFetch(FetchRequest),

    #[serde(rename = "settings.get")]
    SettingsGet { key: String },
    #[serde(rename = "settings.getAll")]
    SettingsGetAll {},
    #[serde(rename = "settings.set")]
    SettingsSet { key: String, value: Value },

    #[serde(rename = "database.execute")]
    DatabaseExecute {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },

    #[serde(rename = "storage.get", rename_all = "camelCase")]
    StorageGet {
        key: String,
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "storage.set", rename_all = "camelCase")]
    StorageSet {
        key: String,
        value: Value,
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "storage.delete", rename_all = "camelCase")]
    StorageDelete {
        key: String,
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "storage.keys", rename_all = "camelCase")]
    StorageKeys {
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "storage.query", rename_all = "camelCase")]
    StorageQuery {
        collection: String,
        #[serde(default)]
        filter: Map<String, Value>,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        user_id: Option<String>,
    },

    #[serde(rename = "secrets.get", rename_all = "camelCase")]
    SecretsGet {
        key: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "secrets.set", rename_all = "camelCase")]
    SecretsSet {
        key: String,
        value: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "secrets.delete", rename_all = "camelCase")]
    SecretsDelete {
        key: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "secrets.list", rename_all = "camelCase")]
    SecretsList {
        #[serde(default)]
        user_id: Option<String>,
    },

    #[serde(rename = "scheduler.schedule")]
    SchedulerSchedule(ScheduledJob),
    #[serde(rename = "scheduler.cancel", rename_all = "camelCase")]
    SchedulerCancel { user_id: String, job_id: String },
    #[serde(rename = "scheduler.reportFireResult")]
    SchedulerReportFireResult(JobFireResult),

    #[serde(rename = "user.getProfile", rename_all = "camelCase")]
    UserGetProfile { user_id: String },
    #[serde(rename = "user.listIds")]
    UserListIds {},

    #[serde(rename = "chat.appendInstruction", rename_all = "camelCase")]
    ChatAppendInstruction { user_id: String, instruction: String },

    #[serde(rename = "tasks.register")]
    TasksRegister(TaskRegistration),
    #[serde(rename = "tasks.unregister", rename_all = "camelCase")]
    TasksUnregister { task_id: String },
    #[serde(rename = "tasks.reportStatus", rename_all = "camelCase")]
    TasksReportStatus {
        task_id: String,
        status: TaskReport,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "tasks.reportHealth", rename_all = "camelCase")]
    TasksReportHealth {
        task_id: String,
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
}

impl ExtensionRequest {
    /// Every method name a unit may call
    pub const METHODS: &'static [&'static str] = &[
        "network.fetch",
        "settings.get",
        "settings.getAll",
        "settings.set",
        "database.execute",
        "storage.get",
        "storage.set",
        "storage.delete",
        "storage.keys",
        "storage.query",
        "secrets.get",
        "secrets.set",
        "secrets.delete",
        "secrets.list",
        "scheduler.schedule",
        "scheduler.cancel",
        "scheduler.reportFireResult",
        "user.getProfile",
        "user.listIds",
        "chat.appendInstruction",
        "tasks.register",
        "tasks.unregister",
        "tasks.reportStatus",
        "tasks.reportHealth",
    ];

    /// Parse a wire request. Unknown methods and bad payloads are distinct errors.
    pub fn from_wire(method: &str, payload: Value) -> Result<Self, RuntimeError> {
        if !Self::METHODS.contains(&method) {
            return Err(RuntimeError::UnknownMethod(method.to_string()));
        }

        // methods without arguments may omit the payload
        let payload = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let mut envelope = Map::new();
        envelope.insert("method".to_string(), Value::String(method.to_string()));
        envelope.insert("payload".to_string(), payload);

        serde_json::from_value(Value::Object(envelope)).map_err(|e| {
            RuntimeError::MalformedPayload {
                method: method.to_string(),
                message: e.to_string(),
            }
        })
    }

    pub fn method(&self) -> &'static str {
        match self {
            ExtensionRequest::NetworkFetch(_) => "network.fetch",
            ExtensionRequest::SettingsGet { .. } => "settings.get",
            ExtensionRequest::SettingsGetAll {} => "settings.getAll",
            ExtensionRequest::SettingsSet { .. } => "settings.set",
            ExtensionRequest::DatabaseExecute { .. } => "database.execute",
            ExtensionRequest::StorageGet { .. } => "storage.get",
            ExtensionRequest::StorageSet { .. } => "storage.set",
            ExtensionRequest::StorageDelete { .. } => "storage.delete",
            ExtensionRequest::StorageKeys { .. } => "storage.keys",
            ExtensionRequest::StorageQuery { .. } => "storage.query",
            ExtensionRequest::SecretsGet { .. } => "secrets.get",
            ExtensionRequest::SecretsSet { .. } => "secrets.set",
            ExtensionRequest::SecretsDelete { .. } => "secrets.delete",
            ExtensionRequest::SecretsList { .. } => "secrets.list",
            ExtensionRequest::SchedulerSchedule(_) => "scheduler.schedule",
            ExtensionRequest::SchedulerCancel { .. } => "scheduler.cancel",
            ExtensionRequest::SchedulerReportFireResult(_) => "scheduler.reportFireResult",
            ExtensionRequest::UserGetProfile { .. } => "user.getProfile",
            ExtensionRequest::UserListIds {} => "user.listIds",
            ExtensionRequest::ChatAppendInstruction { .. } => "chat.appendInstruction",
            ExtensionRequest::TasksRegister(_) => "tasks.register",
            ExtensionRequest::TasksUnregister { .. } => "tasks.unregister",
            ExtensionRequest::TasksReportStatus { .. } => "tasks.reportStatus",
            ExtensionRequest::TasksReportHealth { .. } => "tasks.reportHealth",
        }
    }
}
