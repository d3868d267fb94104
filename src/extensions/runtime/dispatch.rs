//! Capability-checked dispatch of unit requests
//!
//! Every request ends in exactly one `response` message. Denials, unknown
//! methods and bad payloads become failed responses; nothing here may take
//! the dispatcher down.

use super::RuntimeInner;
use crate::extensions::collaborators::validate_user_id;
use crate::extensions::error::{RuntimeError, RuntimeResult};
use crate::extensions::manifest::CollectionDeclaration;
use crate::extensions::permissions::PermissionChecker;
use crate::extensions::protocol::{ExtensionRequest, FetchRequest, HostMessage};
use crate::extensions::secrets::SecretsStore;
use crate::extensions::sql::{check_statement, split_statements};
use crate::extensions::storage::ExtensionStorage;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Handle one request from `extension_id` and build its response
pub(super) async fn handle_request(
    inner: &Arc<RuntimeInner>,
    extension_id: &str,
    request_id: String,
    method: String,
    payload: Value,
) -> HostMessage {
    tracing::debug!(extension = extension_id, request = %request_id, %method, "Dispatching request");

    let result = match ExtensionRequest::from_wire(&method, payload) {
        Ok(request) => dispatch(inner, extension_id, request).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(data) => HostMessage::success(request_id, data),
        Err(err) => {
            match &err {
                RuntimeError::PermissionDenied(denial) => tracing::warn!(
                    extension = extension_id,
                    %method,
                    required = %denial.required,
                    "Request denied"
                ),
                _ => tracing::debug!(extension = extension_id, %method, error = %err, "Request failed"),
            }
            HostMessage::failure(request_id, err.to_string())
        }
    }
}

async fn dispatch(
    inner: &Arc<RuntimeInner>,
    extension_id: &str,
    request: ExtensionRequest,
) -> RuntimeResult<Value> {
    let checker = inner
        .checker(extension_id)
        .ok_or_else(|| RuntimeError::NotLoaded(extension_id.to_string()))?;

    match request {
        ExtensionRequest::NetworkFetch(fetch) => {
            checker.check_network(&fetch.url)?;
            network_fetch(inner, fetch).await
        }

        ExtensionRequest::SettingsGet { key } => {
            let settings = inner.settings(extension_id)?;
            Ok(settings.get(&key).cloned().unwrap_or(Value::Null))
        }
        ExtensionRequest::SettingsGetAll {} => Ok(Value::Object(inner.settings(extension_id)?)),
        ExtensionRequest::SettingsSet { key, value } => {
            checker.check_settings()?;
            inner.store_setting(extension_id, &key, value)?;
            Ok(Value::Bool(true))
        }

        ExtensionRequest::DatabaseExecute { sql, params } => {
            checker.check_database()?;
            database_execute(inner, extension_id, &sql, &params).await
        }

        ExtensionRequest::StorageGet {
            key,
            collection,
            user_id,
        } => {
            let decl = storage_scope(&checker, collection)?;
            let value = with_storage(inner, extension_id, user_id, move |storage| {
                Ok(match decl {
                    Some(decl) => storage.collection_get(&decl, &key)?,
                    None => storage.get(&key)?,
                })
            })
            .await?;
            Ok(value.unwrap_or(Value::Null))
        }
        ExtensionRequest::StorageSet {
            key,
            value,
            collection,
            user_id,
        } => {
            let decl = storage_scope(&checker, collection)?;
            with_storage(inner, extension_id, user_id, move |storage| {
                match decl {
                    Some(decl) => storage.collection_set(&decl, &key, &value)?,
                    None => storage.set(&key, &value)?,
                }
                Ok(())
            })
            .await?;
            Ok(Value::Bool(true))
        }
        ExtensionRequest::StorageDelete {
            key,
            collection,
            user_id,
        } => {
            let decl = storage_scope(&checker, collection)?;
            let removed = with_storage(inner, extension_id, user_id, move |storage| {
                Ok(match decl {
                    Some(decl) => storage.collection_delete(&decl, &key)?,
                    None => storage.delete(&key)?,
                })
            })
            .await?;
            Ok(Value::Bool(removed))
        }
        ExtensionRequest::StorageKeys {
            collection,
            user_id,
        } => {
            let decl = storage_scope(&checker, collection)?;
            let keys = with_storage(inner, extension_id, user_id, move |storage| {
                Ok(match decl {
                    Some(decl) => storage.collection_keys(&decl)?,
                    None => storage.keys()?,
                })
            })
            .await?;
            Ok(json!(keys))
        }
        ExtensionRequest::StorageQuery {
            collection,
            filter,
            limit,
            user_id,
        } => {
            let decl = declared(&checker, &collection)?;
            let rows = with_storage(inner, extension_id, user_id, move |storage| {
                Ok(storage.collection_query(&decl, &filter, limit)?)
            })
            .await?;
            Ok(Value::Array(
                rows.into_iter()
                    .map(|(key, value)| json!({ "key": key, "value": value }))
                    .collect(),
            ))
        }

        ExtensionRequest::SecretsGet { key, user_id } => {
            checker.check_secrets()?;
            check_optional_user(user_id.as_deref())?;
            let owner = extension_id.to_string();
            let value = with_secrets(inner, move |secrets| {
                Ok(secrets.get(&owner, user_id.as_deref(), &key)?)
            })
            .await?;
            Ok(json!(value))
        }
        ExtensionRequest::SecretsSet {
            key,
            value,
            user_id,
        } => {
            checker.check_secrets()?;
            check_optional_user(user_id.as_deref())?;
            let owner = extension_id.to_string();
            with_secrets(inner, move |secrets| {
                Ok(secrets.set(&owner, user_id.as_deref(), &key, &value)?)
            })
            .await?;
            Ok(Value::Bool(true))
        }
        ExtensionRequest::SecretsDelete { key, user_id } => {
            checker.check_secrets()?;
            check_optional_user(user_id.as_deref())?;
            let owner = extension_id.to_string();
            let removed = with_secrets(inner, move |secrets| {
                Ok(secrets.delete(&owner, user_id.as_deref(), &key)?)
            })
            .await?;
            Ok(Value::Bool(removed))
        }
        ExtensionRequest::SecretsList { user_id } => {
            checker.check_secrets()?;
            check_optional_user(user_id.as_deref())?;
            let owner = extension_id.to_string();
            let keys = with_secrets(inner, move |secrets| {
                Ok(secrets.list(&owner, user_id.as_deref())?)
            })
            .await?;
            Ok(json!(keys))
        }

        ExtensionRequest::SchedulerSchedule(job) => {
            checker.check_scheduler()?;
            validate_user_id(&job.user_id).map_err(RuntimeError::InvalidUserId)?;
            let scheduler = inner
                .collaborators
                .scheduler
                .clone()
                .ok_or(RuntimeError::CollaboratorUnavailable("scheduler"))?;
            let job_id = scheduler.schedule(extension_id, job).await?;
            Ok(json!({ "jobId": job_id }))
        }
        ExtensionRequest::SchedulerCancel { user_id, job_id } => {
            checker.check_scheduler()?;
            validate_user_id(&user_id).map_err(RuntimeError::InvalidUserId)?;
            let scheduler = inner
                .collaborators
                .scheduler
                .clone()
                .ok_or(RuntimeError::CollaboratorUnavailable("scheduler"))?;
            Ok(Value::Bool(
                scheduler.cancel(extension_id, &user_id, &job_id).await?,
            ))
        }
        ExtensionRequest::SchedulerReportFireResult(result) => {
            checker.check_scheduler()?;
            validate_user_id(&result.user_id).map_err(RuntimeError::InvalidUserId)?;
            let scheduler = inner
                .collaborators
                .scheduler
                .clone()
                .ok_or(RuntimeError::CollaboratorUnavailable("scheduler"))?;
            scheduler.update_job_result(extension_id, result).await?;
            Ok(Value::Bool(true))
        }

        ExtensionRequest::UserGetProfile { user_id } => {
            checker.check_user_profile()?;
            validate_user_id(&user_id).map_err(RuntimeError::InvalidUserId)?;
            let users = inner
                .collaborators
                .users
                .clone()
                .ok_or(RuntimeError::CollaboratorUnavailable("user directory"))?;
            Ok(users.get_profile(&user_id).await?.unwrap_or(Value::Null))
        }
        ExtensionRequest::UserListIds {} => {
            checker.check_user_profile()?;
            let users = inner
                .collaborators
                .users
                .clone()
                .ok_or(RuntimeError::CollaboratorUnavailable("user directory"))?;
            Ok(json!(users.list_ids().await?))
        }

        ExtensionRequest::ChatAppendInstruction {
            user_id,
            instruction,
        } => {
            checker.check_chat_write()?;
            validate_user_id(&user_id).map_err(RuntimeError::InvalidUserId)?;
            let chat = inner
                .collaborators
                .chat
                .clone()
                .ok_or(RuntimeError::CollaboratorUnavailable("chat"))?;
            chat.append_instruction(extension_id, &user_id, &instruction)
                .await?;
            Ok(Value::Bool(true))
        }

        ExtensionRequest::TasksRegister(registration) => {
            checker.check_background_workers()?;
            if let Some(owner) = registration.owner_user_id.as_deref() {
                validate_user_id(owner).map_err(RuntimeError::InvalidUserId)?;
            }
            // registered under the record so an unload cannot miss it
            let task = inner
                .while_accepting(extension_id, |_| {
                    inner.supervisor.register(extension_id, registration)
                })
                .ok_or_else(|| RuntimeError::NotActive(extension_id.to_string()))??;
            Ok(serde_json::to_value(task).map_err(anyhow::Error::from)?)
        }
        ExtensionRequest::TasksUnregister { task_id } => {
            checker.check_background_workers()?;
            inner.supervisor.unregister_task(extension_id, &task_id)?;
            Ok(Value::Bool(true))
        }
        ExtensionRequest::TasksReportStatus {
            task_id,
            status,
            error,
        } => {
            checker.check_background_workers()?;
            let status = inner
                .supervisor
                .report_status(extension_id, &task_id, status, error)?;
            Ok(json!({ "status": status }))
        }
        ExtensionRequest::TasksReportHealth {
            task_id,
            status,
            message,
        } => {
            checker.check_background_workers()?;
            inner
                .supervisor
                .report_health(extension_id, &task_id, &status, message)?;
            Ok(Value::Bool(true))
        }
    }
}

/// Collection access check; returns the declaration to use for the table
fn declared(checker: &PermissionChecker, collection: &str) -> RuntimeResult<CollectionDeclaration> {
    checker.validate_collection_access(collection)?;
    checker
        .collection(collection)
        .cloned()
        .ok_or_else(|| RuntimeError::MalformedPayload {
            method: "storage".to_string(),
            message: format!("collection '{}' is not declared", collection),
        })
}

/// Collection declaration for a storage call, or the legacy flag check
fn storage_scope(
    checker: &PermissionChecker,
    collection: Option<String>,
) -> RuntimeResult<Option<CollectionDeclaration>> {
    match collection {
        Some(name) => declared(checker, &name).map(Some),
        None => {
            checker.check_storage()?;
            Ok(None)
        }
    }
}

/// Run synchronous SQLite work on the blocking pool
async fn blocking<T, F>(work: F) -> RuntimeResult<T>
where
    F: FnOnce() -> RuntimeResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| anyhow::anyhow!("Storage task failed: {}", e))?
}

async fn with_storage<T, F>(
    inner: &Arc<RuntimeInner>,
    extension_id: &str,
    user_id: Option<String>,
    work: F,
) -> RuntimeResult<T>
where
    F: FnOnce(&ExtensionStorage) -> RuntimeResult<T> + Send + 'static,
    T: Send + 'static,
{
    check_optional_user(user_id.as_deref())?;
    let inner = Arc::clone(inner);
    let extension_id = extension_id.to_string();
    blocking(move || {
        let storage = inner.storage.handle(&extension_id, user_id.as_deref())?;
        work(&*storage)
    })
    .await
}

async fn with_secrets<T, F>(inner: &RuntimeInner, work: F) -> RuntimeResult<T>
where
    F: FnOnce(&SecretsStore) -> RuntimeResult<T> + Send + 'static,
    T: Send + 'static,
{
    let secrets = inner.secrets()?;
    blocking(move || work(&*secrets)).await
}

fn check_optional_user(user_id: Option<&str>) -> RuntimeResult<()> {
    match user_id {
        Some(user) => validate_user_id(user).map_err(RuntimeError::InvalidUserId),
        None => Ok(()),
    }
}

/// Run each statement that stays inside the extension's table namespace.
/// Statements touching anything else are logged and skipped.
async fn database_execute(
    inner: &RuntimeInner,
    extension_id: &str,
    sql: &str,
    params: &[Value],
) -> RuntimeResult<Value> {
    let database = inner
        .collaborators
        .database
        .clone()
        .ok_or(RuntimeError::CollaboratorUnavailable("database"))?;

    let mut results = Vec::new();
    let mut skipped = Vec::new();
    for statement in split_statements(sql) {
        if let Err(reason) = check_statement(extension_id, &statement) {
            tracing::warn!(
                extension = extension_id,
                %reason,
                "Skipping SQL statement outside the extension's tables"
            );
            skipped.push(reason);
            continue;
        }
        results.push(database.execute(extension_id, &statement, params).await?);
    }

    Ok(json!({ "results": results, "skipped": skipped }))
}

async fn network_fetch(inner: &RuntimeInner, fetch: FetchRequest) -> RuntimeResult<Value> {
    let method_name = fetch.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let method = reqwest::Method::from_bytes(method_name.as_bytes()).map_err(|e| {
        RuntimeError::MalformedPayload {
            method: "network.fetch".to_string(),
            message: e.to_string(),
        }
    })?;

    let mut request = inner.http.request(method, &fetch.url);
    for (name, value) in &fetch.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = fetch.body {
        request = request.body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Fetch of {} failed: {}", fetch.url, e))?;

    let max_bytes = inner.config.network.max_response_bytes;
    if response.content_length().unwrap_or(0) > max_bytes as u64 {
        return Err(anyhow::anyhow!("Response exceeds {} bytes", max_bytes).into());
    }

    let status = response.status().as_u16();
    let headers: Map<String, Value> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
        })
        .collect();

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;
        if body.len() + chunk.len() > max_bytes {
            return Err(anyhow::anyhow!("Response exceeds {} bytes", max_bytes).into());
        }
        body.extend_from_slice(&chunk);
    }

    // binary bodies travel base64-encoded
    let (body, encoding) = match String::from_utf8(body) {
        Ok(text) => (text, "utf8"),
        Err(err) => (BASE64.encode(err.into_bytes()), "base64"),
    };

    Ok(json!({
        "status": status,
        "ok": (200..300).contains(&status),
        "headers": headers,
        "body": body,
        "bodyEncoding": encoding,
    }))
}
