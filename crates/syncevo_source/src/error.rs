//! Error types for sync sources.

use crate::types::Luid;
use syncevo_storage::StorageError;
use thiserror::Error;

/// Result type for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors that can occur while tracking or accessing items.
///
/// Errors fall in two classes, see [`SourceError::is_storage_failure`]:
/// item-level errors affect one item and the sync continues with the others,
/// storage-level errors make the whole source unusable for the session.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The revision store could not be read or written.
    #[error("revision store: {0}")]
    Storage(#[from] StorageError),

    /// The backend's data store failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The item does not exist.
    #[error("item {0} not found")]
    NotFound(Luid),

    /// The item content or ID was rejected by the backend.
    #[error("item {luid}: {message}")]
    InvalidItem {
        /// Affected item.
        luid: Luid,
        /// What the backend complained about.
        message: String,
    },

    /// Backend-specific failure.
    #[error("{source_name}: {message}")]
    Backend {
        /// Name of the failing source.
        source_name: String,
        /// Error message.
        message: String,
        /// Whether the source cannot continue.
        fatal: bool,
    },

    /// An operation needing an open source was called on a closed one.
    #[error("source {0} is not open")]
    NotOpen(String),

    /// No unused numeric ID is left.
    #[error("item ID space exhausted")]
    IdSpaceExhausted,
}

impl SourceError {
    /// Creates a backend error that only affects the current item.
    pub fn item_failure(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            source_name: source_name.into(),
            message: message.into(),
            fatal: false,
        }
    }

    /// Creates a backend error after which the source cannot continue.
    pub fn fatal(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            source_name: source_name.into(),
            message: message.into(),
            fatal: true,
        }
    }

    /// Returns true if the error concerns the data store as a whole.
    ///
    /// Storage failures abort the source's part of a session and its
    /// revision map is not committed.
    pub fn is_storage_failure(&self) -> bool {
        match self {
            SourceError::Storage(_)
            | SourceError::Io(_)
            | SourceError::NotOpen(_)
            | SourceError::IdSpaceExhausted => true,
            SourceError::Backend { fatal, .. } => *fatal,
            SourceError::NotFound(_) | SourceError::InvalidItem { .. } => false,
        }
    }
}
