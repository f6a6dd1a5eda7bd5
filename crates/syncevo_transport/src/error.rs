//! Error types for transport agents.

use crate::agent::TransportStatus;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while exchanging messages with a peer.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A message is already in flight.
    #[error("send() called while a message is in flight")]
    Busy,

    /// The agent was shut down.
    #[error("transport is closed")]
    Closed,

    /// No peer address was configured.
    #[error("no URL set")]
    NoUrl,

    /// The URL cannot be used by this agent.
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// Rejected URL.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// `get_reply()` was called without a reply being available.
    #[error("no reply available (transport status {0:?})")]
    NoReply(TransportStatus),

    /// The HTTP client failed before a response was received.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The peer answered with a status other than 200.
    #[error("HTTP status {status}: {reason}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Reason phrase or body excerpt.
        reason: String,
    },

    /// Socket or pipe I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection establishment failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Bluetooth service discovery failed.
    #[error("service discovery failed: {0}")]
    Discovery(String),

    /// The OBEX peer answered a request with a failure response code.
    #[error("OBEX {request} failed with response code {code:#04x}")]
    ObexResponse {
        /// Request that failed, e.g. `PUT`.
        request: &'static str,
        /// Response code sent by the peer.
        code: u8,
    },

    /// The OBEX peer sent a malformed packet.
    #[error("OBEX protocol error: {0}")]
    ObexProtocol(String),

    /// A local IPC frame could not be encoded or decoded.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The local sync child could not be started or died.
    #[error("local sync child failed: {0}")]
    ChildFailed(String),

    /// The local sync child reported a failed session.
    #[error("local sync child reported status {status}: {message}")]
    ChildReport {
        /// Sync status code reported by the child.
        status: u32,
        /// Error message reported by the child.
        message: String,
    },

    /// No reply arrived before the deadline.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The operation was canceled.
    #[error("transfer canceled")]
    Canceled,
}

impl TransportError {
    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if resending the same message may succeed.
    ///
    /// Misuse of the agent, configuration errors and failures reported by a
    /// local child are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(_)
            | TransportError::Io(_)
            | TransportError::Connect(_)
            | TransportError::Discovery(_)
            | TransportError::ObexResponse { .. }
            | TransportError::Timeout => true,
            TransportError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Http(err.to_string())
        }
    }
}
