//! Outstanding host → unit calls, keyed by request id

use crate::extensions::error::RuntimeError;
use crate::extensions::protocol::StreamEvent;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

pub type Reply = Result<Value, RuntimeError>;

enum Waiter {
    Single(oneshot::Sender<Reply>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

struct PendingRequest {
    extension_id: String,
    waiter: Waiter,
    timeout: Option<AbortHandle>,
}

impl PendingRequest {
    fn reject(self, error: RuntimeError) {
        if let Some(timeout) = &self.timeout {
            timeout.abort();
        }
        match self.waiter {
            Waiter::Single(tx) => {
                let _ = tx.send(Err(error));
            }
            Waiter::Stream(tx) => {
                let _ = tx.send(StreamEvent::Error {
                    message: error.to_string(),
                });
            }
        }
    }
}

/// Table of calls waiting on a unit. Ids are unique per call, so no lock
/// beyond the map's own sharding is needed.
#[derive(Clone, Default)]
pub struct PendingRequests {
    map: Arc<DashMap<String, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-reply call that is rejected after `timeout`
    pub fn register(
        &self,
        extension_id: &str,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<Reply>) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let map = Arc::clone(&self.map);
        let id = request_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, request)) = map.remove(&id) {
                tracing::warn!(
                    extension = %request.extension_id,
                    request = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                if let Waiter::Single(tx) = request.waiter {
                    let _ = tx.send(Err(RuntimeError::Timeout {
                        request_id: id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }));
                }
            }
        });

        self.map.insert(
            request_id.clone(),
            PendingRequest {
                extension_id: extension_id.to_string(),
                waiter: Waiter::Single(tx),
                timeout: Some(timer.abort_handle()),
            },
        );
        (request_id, rx)
    }

    /// Register a streaming call. Events are buffered in arrival order.
    pub fn register_stream(
        &self,
        extension_id: &str,
    ) -> (String, mpsc::UnboundedReceiver<StreamEvent>) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.map.insert(
            request_id.clone(),
            PendingRequest {
                extension_id: extension_id.to_string(),
                waiter: Waiter::Stream(tx),
                timeout: None,
            },
        );
        (request_id, rx)
    }

    /// Complete a call. Only the extension that owns the request may resolve it.
    pub fn resolve(&self, extension_id: &str, request_id: &str, result: Result<Value, String>) -> bool {
        let Some((_, request)) = self
            .map
            .remove_if(request_id, |_, pending| pending.extension_id == extension_id)
        else {
            tracing::debug!(
                extension = extension_id,
                request = request_id,
                "Reply for unknown or expired request"
            );
            return false;
        };

        if let Some(timeout) = &request.timeout {
            timeout.abort();
        }
        match request.waiter {
            Waiter::Single(tx) => {
                let _ = tx.send(result.map_err(RuntimeError::Remote));
            }
            Waiter::Stream(tx) => {
                let event = match result {
                    Ok(_) => StreamEvent::Done,
                    Err(message) => StreamEvent::Error { message },
                };
                let _ = tx.send(event);
            }
        }
        true
    }

    /// Append an event to a stream; a terminal event closes it
    pub fn push_event(&self, extension_id: &str, request_id: &str, event: StreamEvent) -> bool {
        let terminal = event.is_terminal();
        {
            let Some(pending) = self.map.get(request_id) else {
                return false;
            };
            if pending.extension_id != extension_id {
                return false;
            }
            let Waiter::Stream(tx) = &pending.waiter else {
                return false;
            };
            let _ = tx.send(event);
        }
        if terminal {
            self.map.remove(request_id);
        }
        true
    }

    /// Drop a call without notifying anyone (consumer went away)
    pub fn cancel(&self, request_id: &str) {
        if let Some((_, request)) = self.map.remove(request_id) {
            if let Some(timeout) = request.timeout {
                timeout.abort();
            }
        }
    }

    /// Reject every call owned by an extension
    pub fn reject_extension(
        &self,
        extension_id: &str,
        error: impl Fn() -> RuntimeError,
    ) -> usize {
        let ids: Vec<String> = self
            .map
            .iter()
            .filter(|entry| entry.value().extension_id == extension_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut rejected = 0;
        for id in ids {
            if let Some((_, request)) = self.map.remove(&id) {
                request.reject(error());
                rejected += 1;
            }
        }
        if rejected > 0 {
            tracing::debug!(extension = extension_id, rejected, "Rejected pending requests");
        }
        rejected
    }

    pub fn count_for(&self, extension_id: &str) -> usize {
        self.map
            .iter()
            .filter(|entry| entry.value().extension_id == extension_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
