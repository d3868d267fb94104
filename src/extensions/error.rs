//! Typed errors for the extension runtime
//!
//! Lifecycle, protocol and dispatch failures are `RuntimeError`. Permission
//! decisions are values (`Denial`) rather than errors so callers can turn
//! them into failed responses without unwinding.

use thiserror::Error;

/// A denied permission check.
///
/// Always names the permission that would have allowed the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Permission string that was required
    pub required: String,
    /// Human-readable reason
    pub reason: String,
}

impl Denial {
    pub fn new(required: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            required: required.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Permission denied: {} (requires '{}')",
            self.reason, self.required
        )
    }
}

/// Manifest validation failures
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

/// Errors surfaced by the runtime core
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Extension not loaded: {0}")]
    NotLoaded(String),

    #[error("Extension already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Extension {0} is not active")]
    NotActive(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("{0}")]
    PermissionDenied(Denial),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Malformed payload for {method}: {message}")]
    MalformedPayload { method: String, message: String },

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("Request cancelled: extension {0} was unloaded")]
    Unloaded(String),

    #[error("Unit for extension {0} exited unexpectedly")]
    UnitCrashed(String),

    #[error("Failed to start unit for {extension_id}: {message}")]
    Launch {
        extension_id: String,
        message: String,
    },

    #[error("Unit channel closed for {0}")]
    ChannelClosed(String),

    #[error("Extension returned error: {0}")]
    Remote(String),

    #[error("{0} is not available")]
    CollaboratorUnavailable(&'static str),

    #[error("Invalid userId: {0}")]
    InvalidUserId(String),

    #[error("Extension {extension_id} does not declare setting '{key}'")]
    UnknownSetting { extension_id: String, key: String },

    #[error("No background task '{task_id}' registered by {extension_id}")]
    TaskNotFound {
        extension_id: String,
        task_id: String,
    },

    #[error("No {kind} '{id}' is registered")]
    UnknownContribution { kind: &'static str, id: String },

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<Denial> for RuntimeError {
    fn from(denial: Denial) -> Self {
        RuntimeError::PermissionDenied(denial)
    }
}

/// Secrets store failures
#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("Secrets database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encrypt,

    /// Wrong key or tampered ciphertext
    #[error("Decryption failed for secret '{key}' (wrong master secret or corrupted record)")]
    Decrypt { key: String },

    #[error("Invalid secret record: {0}")]
    Corrupt(String),

    #[error("User id must not be empty for user-scoped secrets")]
    EmptyUserId,

    #[error("Secrets database lock poisoned")]
    Poisoned,
}

/// Extension storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Field '{field}' is not an indexed field of collection '{collection}'")]
    NotIndexed { collection: String, field: String },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid stored value: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
