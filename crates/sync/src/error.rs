use nearby_core::error::CoreError;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, LocationError};

/// Engine-level error type.
///
/// Wraps [`CoreError`] for domain errors and folds collaborator failures
/// into the categories the UI shell reacts to.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Geolocation was refused. Not retried until an explicit re-enable.
    #[error("Location permission denied")]
    PermissionDenied,

    /// A read or write did not complete. Reads retry on the next poll.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A duplicate insert. Callers treat it as success-equivalent.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An edit referenced a row that no longer exists.
    #[error("Stale reference: {0}")]
    StaleReference(String),

    /// A domain-level error from `nearby_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Profile cache error: {0}")]
    Cache(String),

    #[error("Engine not started")]
    NotStarted,
}

/// Convenience type alias for engine return values.
pub type SyncResult<T> = Result<T, SyncError>;

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Network(msg) => SyncError::Transient(msg),
            BackendError::Conflict(msg) => SyncError::Conflict(msg),
            BackendError::NotFound(msg) => SyncError::StaleReference(msg),
            BackendError::Rejected(msg) => SyncError::Transient(format!("rejected: {msg}")),
        }
    }
}

impl From<LocationError> for SyncError {
    fn from(err: LocationError) -> Self {
        match err {
            LocationError::PermissionDenied => SyncError::PermissionDenied,
            other => SyncError::Transient(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Notices
// ---------------------------------------------------------------------------

/// How the UI shell should present a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Stays on screen until the user acts (e.g. re-enable location).
    PersistentPrompt,
    /// Dismisses itself; local state was rolled back or kept best-effort.
    Transient,
    /// Informational; the action already had the intended effect.
    Benign,
}

/// A non-blocking notice surfaced to the UI shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl SyncError {
    pub fn classify(&self) -> NoticeKind {
        match self {
            SyncError::PermissionDenied => NoticeKind::PersistentPrompt,
            SyncError::Conflict(_) => NoticeKind::Benign,
            SyncError::Transient(_)
            | SyncError::StaleReference(_)
            | SyncError::Core(_)
            | SyncError::Config(_)
            | SyncError::Cache(_)
            | SyncError::NotStarted => NoticeKind::Transient,
        }
    }

    pub fn to_notice(&self) -> Notice {
        Notice {
            kind: self.classify(),
            message: self.to_string(),
        }
    }
}
