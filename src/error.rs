//! Error taxonomy for the save pipeline.
//!
//! Per-asset and per-document failures (`DownloadError`, `ServiceError` during
//! distillation) are caught and logged by the orchestrator. Everything that
//! ends a single save attempt is folded into [`SaveError`].

use std::path::PathBuf;
use thiserror::Error;

/// The page snapshot cannot be treated as a document at all.
#[derive(Debug, Error)]
#[error("page unavailable: {0}")]
pub struct PageUnavailable(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Status(u16),
    Transport(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Status(code) => write!(f, "HTTP {}", code),
            FailureReason::Transport(msg) => write!(f, "{}", msg),
        }
    }
}

/// A single media fetch failed. Never fatal to the save it belongs to.
#[derive(Debug, Clone, Error)]
#[error("download failed for {url}: {reason}")]
pub struct DownloadError {
    pub url: String,
    pub reason: FailureReason,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("permission denied for {0}")]
    PermissionDenied(PathBuf),

    #[error("permission for {0} needs to be reconfirmed")]
    PermissionPending(PathBuf),

    #[error("directory access cannot be requested here: {0}")]
    Unsupported(String),

    #[error("no directory connected")]
    NotConnected,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("state value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown data_type {0:?} in history row")]
    UnknownDataType(String),
}

/// Failures of the external text-generation service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("API key is not set; run `llm-archive api-key <KEY>` first")]
    MissingCredential,

    #[error("content is empty")]
    EmptyContent,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed service response: {0}")]
    Malformed(String),

    #[error("service request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("at most {max} paths can be pinned")]
    PinLimit { max: usize },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Everything that ends one save attempt.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("{0}")]
    WrongPage(String),

    #[error(transparent)]
    PageUnavailable(#[from] PageUnavailable),

    #[error("the conversation is empty (make sure it is fully loaded)")]
    EmptyContent,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("directory permission needs reconfirmation; run `llm-archive reconfirm`")]
    PermissionPending,

    #[error("failed to write {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<StoreError> for SaveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PermissionDenied(path) => {
                SaveError::PermissionDenied(path.display().to_string())
            }
            StoreError::PermissionPending(_) => SaveError::PermissionPending,
            StoreError::Unsupported(msg) => SaveError::PermissionDenied(msg),
            StoreError::NotConnected => SaveError::PermissionDenied("no directory connected".into()),
            StoreError::Io { path, source } => SaveError::WriteFailed {
                path,
                reason: source.to_string(),
            },
            StoreError::State(e) => SaveError::State(e),
        }
    }
}
