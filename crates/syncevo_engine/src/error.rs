//! Error types for the sync engine.

use crate::report::SyncStatus;
use syncevo_source::SourceError;
use syncevo_storage::StorageError;
use syncevo_transport::TransportError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a sync session.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether resending the message can help.
        retryable: bool,
    },

    /// The protocol engine reported an error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No usable credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The configuration is incomplete or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration properties could not be read.
    #[error("configuration storage: {0}")]
    Storage(#[from] StorageError),

    /// A source failed as a whole.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// A session with the same name is already running.
    #[error("session {0} is already running")]
    SessionBusy(String),

    /// The user aborted the session.
    #[error("sync aborted by user")]
    Aborted,

    /// The user suspended the session.
    #[error("sync suspended by user")]
    Suspended,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns the session status this error ends a session with.
    pub fn status(&self) -> SyncStatus {
        match self {
            SyncError::Transport { .. } => SyncStatus::TransportFailure,
            SyncError::Source(err) if err.is_storage_failure() => SyncStatus::DatastoreFailure,
            SyncError::Aborted => SyncStatus::Aborted,
            SyncError::Suspended => SyncStatus::Suspended,
            SyncError::AuthenticationFailed(_) => SyncStatus::Unauthorized,
            _ => SyncStatus::Fatal,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        Self::Transport {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}
