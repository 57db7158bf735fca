//! Error types shared across the store, the sync engine and session handling.

use thiserror::Error;

/// Failure reported by the remote data-access layer.
///
/// The sync engine only cares about three classes: already applied
/// (`AlreadyExists`), transient (`Unreachable`, `Timeout`) and everything
/// else. See [`RemoteError::is_already_exists`] and
/// [`RemoteError::is_transient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend request timed out after {0}s")]
    Timeout(u64),

    /// Uniqueness violation: the row was already written by an earlier attempt.
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("{message} (HTTP {status})")]
    Rejected { status: u16, message: String },

    #[error("invalid response from backend: {0}")]
    InvalidResponse(String),

    #[error("could not encode request: {0}")]
    Encode(String),
}

impl RemoteError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, RemoteError::AlreadyExists(_))
    }

    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Unreachable(_) | RemoteError::Timeout(_) => true,
            RemoteError::Rejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Login failures surfaced synchronously to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is inactive")]
    Inactive,

    #[error("Too many failed attempts. Try again in {minutes} minute(s).")]
    LockedOut { minutes: i64 },

    #[error("local storage failure: {0}")]
    Storage(String),
}

/// Crate-level error for façade and store operations.
#[derive(Debug, Error)]
pub enum PosError {
    #[error("local storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no active shop session")]
    NoSession,
}

pub type PosResult<T> = Result<T, PosError>;
