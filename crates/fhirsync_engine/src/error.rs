//! Error types for the sync engine.

use fhirsync_model::{MappingError, ResourceType};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No authenticated connection is available.
    #[error("not authenticated: no active connection")]
    NotAuthenticated,

    /// The server rejected the credentials (expired or revoked token).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Fetching resources from the server failed.
    #[error("fetch error: {message}")]
    Fetch {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A single resource could not be normalized.
    #[error("failed to map {resource_type} resource: {source}")]
    Mapping {
        /// Type of the offending resource.
        resource_type: ResourceType,
        /// Underlying mapping error.
        #[source]
        source: MappingError,
    },

    /// The local data store failed.
    #[error("local store error: {0}")]
    Store(String),

    /// The sync state store failed.
    #[error("sync state store error: {0}")]
    StateStore(String),

    /// No pending conflict has this ID.
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    /// The requested resolution cannot be applied.
    #[error("invalid conflict resolution: {0}")]
    InvalidResolution(String),

    /// Background sync needs a running tokio runtime.
    #[error("no tokio runtime available for background sync")]
    NoRuntime,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Creates a retryable fetch error.
    pub fn fetch_retryable(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable fetch error.
    pub fn fetch_fatal(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error stems from missing or rejected credentials.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            EngineError::NotAuthenticated | EngineError::AuthenticationFailed(_)
        )
    }

    /// Returns true if the caller may simply retry later.
    ///
    /// Authentication failures need the user to sign in again and are the
    /// only errors that are not recoverable.
    pub fn is_recoverable(&self) -> bool {
        !self.is_authentication()
    }

    /// Returns true if an immediate retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Fetch { retryable, .. } => *retryable,
            EngineError::Store(_) | EngineError::StateStore(_) => true,
            _ => false,
        }
    }
}
