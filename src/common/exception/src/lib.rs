//! Error taxonomy shared by every layerfilter crate.
//!
//! Storage-engine errors never cross the backend boundary as-is: each adapter
//! maps its native failures onto [`FilterError`] before returning. The enum is
//! `Clone` because a single materialization build may be awaited by several
//! callers, and every one of them must observe the same failure.

use std::fmt::{self, Display};
use std::time::Duration;

use thiserror::Error;

/// Unified error type for filter execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    /// No backend in the ranked list is usable for the layer.
    #[error("no usable backend for layer '{layer}': {reason}")]
    BackendUnavailable { layer: String, reason: String },

    /// A backend instance is already bound to this layer for the session.
    #[error("backend '{backend}' is already bound to layer '{layer}'")]
    BackendAlreadyBound { layer: String, backend: String },

    /// The reference geometry could not be repaired by any strategy.
    #[error("invalid reference geometry: {0}")]
    InvalidGeometry(String),

    /// The embedded database file stayed locked after every retry.
    #[error("database '{path}' is locked (gave up after {attempts} attempts)")]
    TransientLock { path: String, attempts: u32 },

    /// A backend call exceeded the configured timeout.
    #[error("{backend} backend timed out after {elapsed:?}")]
    Timeout { backend: String, elapsed: Duration },

    /// The task was cancelled. This is a terminal state, not a failure.
    #[error("filter request was cancelled")]
    Cancelled,

    /// The attribute expression is outside the supported grammar.
    #[error("invalid attribute expression: {0}")]
    InvalidExpression(String),

    /// A storage engine failure that does not belong to any other kind.
    #[error("{backend} storage error: {message}")]
    Storage { backend: String, message: String },

    /// The host collaborator refused or failed an operation.
    #[error("host error: {0}")]
    Host(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Fieldless mirror of [`FilterError`] for matching and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BackendUnavailable,
    BackendAlreadyBound,
    InvalidGeometry,
    TransientLock,
    Timeout,
    Cancelled,
    InvalidExpression,
    Storage,
    Host,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BackendUnavailable => "BackendUnavailableError",
            ErrorKind::BackendAlreadyBound => "BackendAlreadyBoundError",
            ErrorKind::InvalidGeometry => "InvalidGeometryError",
            ErrorKind::TransientLock => "TransientLockError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::InvalidExpression => "InvalidExpressionError",
            ErrorKind::Storage => "StorageError",
            ErrorKind::Host => "HostError",
            ErrorKind::Internal => "InternalError",
        };
        write!(f, "{name}")
    }
}

impl FilterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FilterError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            FilterError::BackendAlreadyBound { .. } => ErrorKind::BackendAlreadyBound,
            FilterError::InvalidGeometry(_) => ErrorKind::InvalidGeometry,
            FilterError::TransientLock { .. } => ErrorKind::TransientLock,
            FilterError::Timeout { .. } => ErrorKind::Timeout,
            FilterError::Cancelled => ErrorKind::Cancelled,
            FilterError::InvalidExpression(_) => ErrorKind::InvalidExpression,
            FilterError::Storage { .. } => ErrorKind::Storage,
            FilterError::Host(_) => ErrorKind::Host,
            FilterError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Cancellation ends a task without it being reported as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FilterError::Cancelled)
    }

    /// Errors that a bounded retry loop may attempt again.
    pub fn is_transient(&self) -> bool {
        matches!(self, FilterError::TransientLock { .. })
    }

    pub fn storage(backend: impl Into<String>, message: impl Display) -> Self {
        FilterError::Storage {
            backend: backend.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
