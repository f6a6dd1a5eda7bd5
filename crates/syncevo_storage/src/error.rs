//! Error types for tracking node operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing a tracking node.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The node file could not be parsed.
    #[error("node {path} corrupted at line {line}: {message}")]
    Corrupted {
        /// File backing the node.
        path: PathBuf,
        /// One-based line number of the offending entry.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// Another session holds the node's lock file.
    #[error("node {0} is locked by another session")]
    Locked(PathBuf),

    /// A property value could not be converted to the requested type.
    #[error("property {key}: invalid value {value:?}, expected {expected}")]
    InvalidValue {
        /// Property name.
        key: String,
        /// Raw stored value.
        value: String,
        /// Human readable description of the expected type.
        expected: &'static str,
    },

    /// The node refused a write (read-only or injected failure).
    #[error("write to node {0} rejected")]
    WriteRejected(String),
}

impl StorageError {
    pub(crate) fn invalid_value(key: &str, value: &str, expected: &'static str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected,
        }
    }
}
