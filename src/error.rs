//! Error types for smartcache.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! specific failure and decide between an inline banner, a rollback, or a
//! forced re-authentication.

use thiserror::Error;

use crate::entity::EntityKey;
use crate::optimistic::MutationId;
use crate::storage::StorageError;

/// Validation errors raised before anything is dispatched or written.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid email address: {value}")]
    InvalidEmail {
        value: String,
    },

    #[error("Patch wrote key {key} which was not declared as affected")]
    UndeclaredKey {
        key: EntityKey,
    },

    #[error("Mutation {id} was already applied")]
    DuplicateMutation {
        id: MutationId,
    },

    #[error("Too many placeholder entities in one patch (max: {max})")]
    TooManyPlaceholders {
        max: usize,
    },

    #[error("Invalid filter encoding: {reason}")]
    InvalidFilter {
        reason: String,
    },

    #[error("Invalid query shape: {reason}")]
    InvalidShape {
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while reconciling or running cache operations.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Entity not found: {key}")]
    EntityNotFound {
        key: EntityKey,
    },

    #[error("Mutation not found: {id}")]
    MutationNotFound {
        id: MutationId,
    },

    #[error("Mutation {id} is not pending (state: {state})")]
    MutationNotPending {
        id: MutationId,
        state: String,
    },

    #[error("Field '{field}' on {key} is not a connection")]
    NotAConnection {
        key: EntityKey,
        field: String,
    },

    #[error("Request for view '{view}' was cancelled")]
    Cancelled {
        view: String,
    },

    #[error("Polling gave up after {attempts} attempts")]
    PollExhausted {
        attempts: u32,
    },

    #[error("Stream disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Malformed server payload: {reason}")]
    MalformedPayload {
        reason: String,
    },
}

/// Transport errors at the GraphQL / AJAX boundary.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Failed to serialize request: {message}")]
    SerializationFailed {
        message: String,
    },

    #[error("Failed to deserialize response: {message}")]
    DeserializationFailed {
        message: String,
    },

    #[error("Server error (code {code}): {message}")]
    ServerError {
        code: u32,
        message: String,
    },

    #[error("GraphQL errors: {}", .messages.join("; "))]
    GraphqlErrors {
        messages: Vec<String>,
        codes: Vec<String>,
    },

    #[error("Action '{action}' failed: {message}")]
    ActionFailed {
        action: String,
        message: String,
    },
}

impl TransportError {
    /// Returns true if the server rejected the credentials.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        match self {
            Self::ServerError { code, .. } => *code == 401 || *code == 403,
            Self::GraphqlErrors { codes, .. } => codes
                .iter()
                .any(|c| c == "invalid_token" || c == "UNAUTHENTICATED"),
            _ => false,
        }
    }
}

/// Top-level error type for smartcache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Input was rejected before anything ran.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A cache operation failed while running.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// The network boundary failed; auth rejections become [`CacheError::Auth`].
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// The entity store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Credentials were rejected; the session needs re-authentication.
    #[error("Authentication failed: {message}")]
    Auth {
        /// Server's reason, when it gave one.
        message: String,
    },

    /// Broken internal invariant, such as a poisoned lock.
    #[error("Internal error: {message}")]
    Internal {
        /// What broke.
        message: String,
    },
}

impl From<TransportError> for CacheError {
    fn from(err: TransportError) -> Self {
        if err.is_auth_rejection() {
            Self::Auth {
                message: err.to_string(),
            }
        } else {
            Self::Transport(err)
        }
    }
}

impl CacheError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if the credentials must be cleared and the user re-authenticated.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the UI should offer a retry affordance.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Auth { .. } | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
            Self::Transport(e) => match e {
                TransportError::ConnectionFailed { .. } => true,
                TransportError::ServerError { code, .. } => *code >= 500,
                _ => false,
            },
            Self::Storage(_) => false,
        }
    }
}

/// Result type alias for smartcache operations.
pub type CacheResult<T> = Result<T, CacheError>;
