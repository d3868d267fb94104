//! Host services the runtime delegates to
//!
//! All collaborators are optional. When one is missing, requests that need
//! it are denied with a reason naming the missing service.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

static USER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.@+-]{0,127}$").expect("valid regex"));

/// Reject user ids that are empty or could escape a path or query
pub fn validate_user_id(user_id: &str) -> Result<(), String> {
    if user_id.trim().is_empty() {
        return Err("userId must not be empty".to_string());
    }
    if user_id.contains(&['/', '\\', '\0'][..]) || user_id.contains("..") {
        return Err(format!("userId contains forbidden characters: {:?}", user_id));
    }
    if !USER_ID_RE.is_match(user_id) {
        return Err(format!("userId is not a valid identifier: {:?}", user_id));
    }
    Ok(())
}

/// Executes SQL against the host database on behalf of an extension
#[async_trait]
pub trait DatabaseExecutor: Send + Sync {
    async fn execute(&self, extension_id: &str, sql: &str, params: &[Value]) -> Result<Value>;
}

/// A job an extension asks the host scheduler to run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    /// Assigned by the scheduler when absent
    #[serde(default)]
    pub id: Option<String>,
    pub user_id: String,
    pub name: String,
    /// Cron expression or RFC 3339 timestamp, interpreted by the scheduler
    pub schedule: String,
    #[serde(default)]
    pub payload: Value,
}

/// Outcome an extension reports after a scheduled job fired
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobFireResult {
    pub job_id: String,
    pub user_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Returns the job id
    async fn schedule(&self, extension_id: &str, job: ScheduledJob) -> Result<String>;
    async fn cancel(&self, extension_id: &str, user_id: &str, job_id: &str) -> Result<bool>;
    async fn update_job_result(&self, extension_id: &str, result: JobFireResult) -> Result<()>;
}

/// Lets extensions add instructions to a user's conversation
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn append_instruction(
        &self,
        extension_id: &str,
        user_id: &str,
        instruction: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Value>>;
    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// Services injected at runtime construction
#[derive(Clone, Default)]
pub struct Collaborators {
    pub database: Option<Arc<dyn DatabaseExecutor>>,
    pub scheduler: Option<Arc<dyn Scheduler>>,
    pub chat: Option<Arc<dyn ChatSink>>,
    pub users: Option<Arc<dyn UserDirectory>>,
}

impl Collaborators {
    pub fn with_database(mut self, database: Arc<dyn DatabaseExecutor>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatSink>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }
}
