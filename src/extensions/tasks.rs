//! Background task supervisor
//!
//! Tracks long-running jobs that extensions register and applies their
//! restart policy. Starting and stopping a job inside its unit goes through
//! [`TaskControl`]; the supervisor itself only owns records and timers.
//!
//! State per task:
//!
//! ```text
//! register ──► running ──failed/stopped──► restarting ──timer──► running
//!                 │                            │
//!                 │                            └─ restarts used up ─► exhausted
//!                 └─ policy says no restart ─► failed | stopped
//! ```

use super::error::RuntimeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Restarts past this count with `max_restarts = 0` are logged as flapping
const FLAPPING_WARN_EVERY: u32 = 100;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    /// Never restart automatically
    Never,
    /// Restart after a failure, not after a clean stop
    #[default]
    OnFailure,
    /// Restart after a failure or a stop the host did not ask for
    Always,
}

/// When and how often a task is restarted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartPolicy {
    pub mode: RestartMode,
    /// 0 means unlimited
    pub max_restarts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            mode: RestartMode::OnFailure,
            max_restarts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RestartPolicy {
    /// `min(max_delay, initial_delay * multiplier^restart_count)`
    pub fn delay_for(&self, restart_count: u32) -> Duration {
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let exponent = restart_count.min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn restarts_after(&self, failure: bool) -> bool {
        match self.mode {
            RestartMode::Never => false,
            RestartMode::OnFailure => failure,
            RestartMode::Always => true,
        }
    }

    fn exhausted(&self, restart_count: u32) -> bool {
        self.max_restarts > 0 && restart_count >= self.max_restarts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Running,
    Stopped,
    Failed,
    Restarting,
    /// Restart budget used up; no further automatic restarts
    Exhausted,
}

/// What a unit reports about one of its tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskReport {
    Running,
    Stopped,
    Failed,
}

/// Payload of `tasks.register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRegistration {
    pub task_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHealth {
    pub status: String,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Snapshot of one supervised task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTask {
    pub extension_id: String,
    pub task_id: String,
    pub display_name: String,
    pub owner_user_id: Option<String>,
    pub restart_policy: RestartPolicy,
    pub status: TaskStatus,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub last_health: Option<TaskHealth>,
    pub registered_at: DateTime<Utc>,
}

/// Lifecycle events published by the supervisor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TaskEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        extension_id: String,
        task_id: String,
        restart_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    Stopped { extension_id: String, task_id: String },
    #[serde(rename_all = "camelCase")]
    Failed {
        extension_id: String,
        task_id: String,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RestartScheduled {
        extension_id: String,
        task_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Exhausted {
        extension_id: String,
        task_id: String,
        restarts: u32,
    },
    #[serde(rename_all = "camelCase")]
    Health {
        extension_id: String,
        task_id: String,
        status: String,
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Unregistered { extension_id: String, task_id: String },
}

/// Starts and stops a task inside its owning unit.
///
/// Called with the supervisor lock held; implementations must not call back
/// into the supervisor.
pub trait TaskControl: Send + Sync {
    fn start(&self, extension_id: &str, task_id: &str) -> Result<(), String>;
    fn stop(&self, extension_id: &str, task_id: &str);
}

type TaskKey = (String, String);

struct TaskEntry {
    task: BackgroundTask,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever a pending timer becomes stale
    epoch: u64,
    /// The host asked for this stop; `always` does not restart it
    stop_requested: bool,
}

impl TaskEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.epoch += 1;
    }
}

struct Inner {
    control: Arc<dyn TaskControl>,
    tasks: Mutex<HashMap<TaskKey, TaskEntry>>,
    events: broadcast::Sender<TaskEvent>,
}

/// Supervises every background task of every extension
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

impl TaskSupervisor {
    pub fn new(control: Arc<dyn TaskControl>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                control,
                tasks: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskKey, TaskEntry>> {
        lock_tasks(&self.inner)
    }

    /// Create (or replace) a task record and start it immediately
    pub fn register(
        &self,
        extension_id: &str,
        registration: TaskRegistration,
    ) -> Result<BackgroundTask, RuntimeError> {
        let key = (extension_id.to_string(), registration.task_id.clone());
        let mut tasks = self.lock();

        if let Some(mut previous) = tasks.remove(&key) {
            previous.cancel_timer();
            tracing::debug!(
                extension = extension_id,
                task = %registration.task_id,
                "Re-registering background task"
            );
        }

        let display_name = if registration.display_name.is_empty() {
            registration.task_id.clone()
        } else {
            registration.display_name
        };
        let task = BackgroundTask {
            extension_id: extension_id.to_string(),
            task_id: registration.task_id.clone(),
            display_name,
            owner_user_id: registration.owner_user_id,
            restart_policy: registration.restart_policy,
            status: TaskStatus::Running,
            restart_count: 0,
            last_error: None,
            last_health: None,
            registered_at: Utc::now(),
        };

        self.inner
            .control
            .start(extension_id, &registration.task_id)
            .map_err(|message| RuntimeError::Launch {
                extension_id: extension_id.to_string(),
                message,
            })?;

        tracing::info!(
            extension = extension_id,
            task = %task.task_id,
            policy = ?task.restart_policy.mode,
            "Background task registered"
        );
        tasks.insert(
            key,
            TaskEntry {
                task: task.clone(),
                timer: None,
                epoch: 0,
                stop_requested: false,
            },
        );
        self.emit(TaskEvent::Started {
            extension_id: task.extension_id.clone(),
            task_id: task.task_id.clone(),
            restart_count: 0,
        });
        Ok(task)
    }

    /// Apply a status report from the owning unit
    pub fn report_status(
        &self,
        extension_id: &str,
        task_id: &str,
        report: TaskReport,
        error: Option<String>,
    ) -> Result<TaskStatus, RuntimeError> {
        let mut tasks = self.lock();
        let entry = tasks
            .get_mut(&(extension_id.to_string(), task_id.to_string()))
            .ok_or_else(|| not_found(extension_id, task_id))?;

        match report {
            TaskReport::Running => {
                if entry.task.status == TaskStatus::Restarting {
                    entry.cancel_timer();
                }
                if entry.task.status != TaskStatus::Exhausted {
                    entry.task.status = TaskStatus::Running;
                    entry.stop_requested = false;
                }
            }
            TaskReport::Failed => {
                entry.task.last_error = error;
                // a task the host stopped stays stopped however it exits
                if !entry.stop_requested {
                    self.handle_exit(entry, true);
                }
            }
            TaskReport::Stopped => {
                if entry.stop_requested {
                    entry.task.status = TaskStatus::Stopped;
                } else {
                    self.handle_exit(entry, false);
                }
            }
        }
        Ok(entry.task.status)
    }

    fn handle_exit(&self, entry: &mut TaskEntry, failure: bool) {
        match entry.task.status {
            // terminal states and an already scheduled restart absorb further exits
            TaskStatus::Exhausted | TaskStatus::Restarting => return,
            _ => {}
        }

        let task = &mut entry.task;
        let policy = task.restart_policy.clone();

        if !policy.restarts_after(failure) {
            task.status = if failure {
                TaskStatus::Failed
            } else {
                TaskStatus::Stopped
            };
            tracing::info!(
                extension = %task.extension_id,
                task = %task.task_id,
                status = ?task.status,
                "Background task ended"
            );
            let event = if failure {
                TaskEvent::Failed {
                    extension_id: task.extension_id.clone(),
                    task_id: task.task_id.clone(),
                    error: task.last_error.clone(),
                }
            } else {
                TaskEvent::Stopped {
                    extension_id: task.extension_id.clone(),
                    task_id: task.task_id.clone(),
                }
            };
            self.emit(event);
            return;
        }

        if policy.exhausted(task.restart_count) {
            task.status = TaskStatus::Exhausted;
            tracing::warn!(
                extension = %task.extension_id,
                task = %task.task_id,
                restarts = task.restart_count,
                "Background task exhausted its restart budget"
            );
            self.emit(TaskEvent::Exhausted {
                extension_id: task.extension_id.clone(),
                task_id: task.task_id.clone(),
                restarts: task.restart_count,
            });
            return;
        }

        let delay = policy.delay_for(task.restart_count);
        task.restart_count += 1;
        task.status = TaskStatus::Restarting;
        if policy.max_restarts == 0 && task.restart_count % FLAPPING_WARN_EVERY == 0 {
            tracing::warn!(
                extension = %task.extension_id,
                task = %task.task_id,
                restarts = task.restart_count,
                "Background task keeps failing with unlimited restarts"
            );
        }
        tracing::debug!(
            extension = %task.extension_id,
            task = %task.task_id,
            attempt = task.restart_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling task restart"
        );
        self.emit(TaskEvent::RestartScheduled {
            extension_id: task.extension_id.clone(),
            task_id: task.task_id.clone(),
            attempt: task.restart_count,
            delay_ms: delay.as_millis() as u64,
        });

        let key = (task.extension_id.clone(), task.task_id.clone());
        entry.cancel_timer();
        let epoch = entry.epoch;
        let deadline = tokio::time::Instant::now() + delay;
        let weak = Arc::downgrade(&self.inner);
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire_restart(weak, key, epoch);
        }));
    }

    /// Update the health string without touching lifecycle state
    pub fn report_health(
        &self,
        extension_id: &str,
        task_id: &str,
        status: &str,
        message: Option<String>,
    ) -> Result<(), RuntimeError> {
        let mut tasks = self.lock();
        let entry = tasks
            .get_mut(&(extension_id.to_string(), task_id.to_string()))
            .ok_or_else(|| not_found(extension_id, task_id))?;
        entry.task.last_health = Some(TaskHealth {
            status: status.to_string(),
            message: message.clone(),
            at: Utc::now(),
        });
        self.emit(TaskEvent::Health {
            extension_id: extension_id.to_string(),
            task_id: task_id.to_string(),
            status: status.to_string(),
            message,
        });
        Ok(())
    }

    /// Cancel any pending restart and tell the unit to stop the task
    pub fn stop_task(&self, extension_id: &str, task_id: &str) -> Result<(), RuntimeError> {
        let mut tasks = self.lock();
        let entry = tasks
            .get_mut(&(extension_id.to_string(), task_id.to_string()))
            .ok_or_else(|| not_found(extension_id, task_id))?;
        entry.cancel_timer();
        entry.stop_requested = true;
        let was_running = entry.task.status == TaskStatus::Running;
        entry.task.status = TaskStatus::Stopped;
        if was_running {
            self.inner.control.stop(extension_id, task_id);
        }
        self.emit(TaskEvent::Stopped {
            extension_id: extension_id.to_string(),
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// Stop a task and forget it
    pub fn unregister_task(&self, extension_id: &str, task_id: &str) -> Result<(), RuntimeError> {
        self.stop_task(extension_id, task_id)?;
        self.lock()
            .remove(&(extension_id.to_string(), task_id.to_string()));
        tracing::info!(extension = extension_id, task = task_id, "Background task unregistered");
        self.emit(TaskEvent::Unregistered {
            extension_id: extension_id.to_string(),
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// Drop every task of an extension (used on unload). Returns how many were removed.
    pub fn unregister_extension(&self, extension_id: &str) -> usize {
        let mut tasks = self.lock();
        let keys: Vec<TaskKey> = tasks
            .keys()
            .filter(|(ext, _)| ext == extension_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(mut entry) = tasks.remove(key) {
                entry.cancel_timer();
                self.emit(TaskEvent::Unregistered {
                    extension_id: key.0.clone(),
                    task_id: key.1.clone(),
                });
            }
        }
        if !keys.is_empty() {
            tracing::debug!(extension = extension_id, removed = keys.len(), "Removed background tasks");
        }
        keys.len()
    }

    pub fn get(&self, extension_id: &str, task_id: &str) -> Option<BackgroundTask> {
        self.lock()
            .get(&(extension_id.to_string(), task_id.to_string()))
            .map(|entry| entry.task.clone())
    }

    /// All tasks, ordered by (extension, task)
    pub fn list(&self) -> Vec<BackgroundTask> {
        let mut tasks: Vec<BackgroundTask> =
            self.lock().values().map(|entry| entry.task.clone()).collect();
        tasks.sort_by(|a, b| {
            (a.extension_id.as_str(), a.task_id.as_str())
                .cmp(&(b.extension_id.as_str(), b.task_id.as_str()))
        });
        tasks
    }

    pub fn list_for_extension(&self, extension_id: &str) -> Vec<BackgroundTask> {
        self.list()
            .into_iter()
            .filter(|task| task.extension_id == extension_id)
            .collect()
    }

    fn emit(&self, event: TaskEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

fn lock_tasks(inner: &Inner) -> MutexGuard<'_, HashMap<TaskKey, TaskEntry>> {
    // a panic while holding the lock leaves records consistent enough to keep going
    inner
        .tasks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fire_restart(inner: Weak<Inner>, key: TaskKey, epoch: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut tasks = lock_tasks(&inner);
    let Some(entry) = tasks.get_mut(&key) else {
        return;
    };
    if entry.epoch != epoch || entry.task.status != TaskStatus::Restarting {
        return;
    }
    entry.timer = None;

    let (extension_id, task_id) = &key;
    match inner.control.start(extension_id, task_id) {
        Ok(()) => {
            entry.task.status = TaskStatus::Running;
            entry.stop_requested = false;
            tracing::info!(
                extension = %extension_id,
                task = %task_id,
                attempt = entry.task.restart_count,
                "Background task restarted"
            );
            let _ = inner.events.send(TaskEvent::Started {
                extension_id: extension_id.clone(),
                task_id: task_id.clone(),
                restart_count: entry.task.restart_count,
            });
        }
        Err(message) => {
            entry.task.status = TaskStatus::Failed;
            entry.task.last_error = Some(message.clone());
            tracing::warn!(
                extension = %extension_id,
                task = %task_id,
                error = %message,
                "Failed to restart background task"
            );
            let _ = inner.events.send(TaskEvent::Failed {
                extension_id: extension_id.clone(),
                task_id: task_id.clone(),
                error: Some(message),
            });
        }
    }
}

fn not_found(extension_id: &str, task_id: &str) -> RuntimeError {
    RuntimeError::TaskNotFound {
        extension_id: extension_id.to_string(),
        task_id: task_id.to_string(),
    }
}
