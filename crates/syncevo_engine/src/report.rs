//! Session results.

use crate::protocol::ItemStatus;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use syncevo_source::{Luid, SyncMode};

/// Final status of a session or source, with SyncEvolution's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncStatus {
    /// Completed successfully.
    #[default]
    Ok,
    /// Credentials were rejected or missing.
    Unauthorized,
    /// Unrecoverable error.
    Fatal,
    /// A data store failed as a whole.
    DatastoreFailure,
    /// The user aborted the session.
    Aborted,
    /// The user suspended the session.
    Suspended,
    /// The peer could not be reached or stopped answering.
    TransportFailure,
}

impl SyncStatus {
    /// Returns the numeric status code.
    pub fn code(&self) -> u32 {
        match self {
            SyncStatus::Ok => 0,
            SyncStatus::Unauthorized => 401,
            SyncStatus::Fatal => 500,
            SyncStatus::DatastoreFailure => 510,
            SyncStatus::Aborted => 20017,
            SyncStatus::Suspended => 20036,
            SyncStatus::TransportFailure => 20043,
        }
    }

    /// Maps a numeric code back to a status. Unknown failure codes are
    /// fatal.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 | 200 => SyncStatus::Ok,
            401 | 407 => SyncStatus::Unauthorized,
            510 => SyncStatus::DatastoreFailure,
            20017 => SyncStatus::Aborted,
            20036 => SyncStatus::Suspended,
            20043 => SyncStatus::TransportFailure,
            _ => SyncStatus::Fatal,
        }
    }

    /// Returns true for [`SyncStatus::Ok`].
    pub fn is_success(&self) -> bool {
        *self == SyncStatus::Ok
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SyncStatus::Ok => "ok",
            SyncStatus::Unauthorized => "unauthorized",
            SyncStatus::Fatal => "fatal error",
            SyncStatus::DatastoreFailure => "data store failure",
            SyncStatus::Aborted => "aborted",
            SyncStatus::Suspended => "suspended",
            SyncStatus::TransportFailure => "transport failure",
        };
        write!(f, "{text} ({})", self.code())
    }
}

/// Number of items per kind of change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    /// New items.
    pub added: u64,
    /// Modified items.
    pub updated: u64,
    /// Removed items.
    pub deleted: u64,
}

impl ChangeCounts {
    /// Returns the sum of all changes.
    pub fn total(&self) -> u64 {
        self.added + self.updated + self.deleted
    }
}

/// One item the session could not process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    /// The item, if it already had a LUID.
    pub luid: Option<Luid>,
    /// Status sent to the peer.
    pub status: ItemStatus,
    /// Error description.
    pub message: String,
}

/// Outcome for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    /// Source name.
    pub name: String,
    /// Mode the source ran in.
    pub mode: SyncMode,
    /// Local changes offered to the peer.
    pub local_changes: ChangeCounts,
    /// Changes received from the peer and applied locally.
    pub remote_changes: ChangeCounts,
    /// Items sent to the peer.
    pub items_sent: u64,
    /// Items that could not be processed.
    pub item_errors: Vec<ItemError>,
    /// Whether the revision map was committed.
    pub committed: bool,
    /// Final status.
    pub status: SyncStatus,
    /// Reason for a failed status.
    pub error: Option<String>,
}

impl SourceReport {
    /// Creates an empty report.
    pub fn new(name: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            name: name.into(),
            mode,
            local_changes: ChangeCounts::default(),
            remote_changes: ChangeCounts::default(),
            items_sent: 0,
            item_errors: Vec::new(),
            committed: false,
            status: SyncStatus::Ok,
            error: None,
        }
    }

    /// Marks the source as failed. The first failure wins.
    pub fn fail(&mut self, status: SyncStatus, error: impl Into<String>) {
        if self.status.is_success() {
            self.status = status;
            self.error = Some(error.into());
        }
    }
}

/// Outcome of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncReport {
    /// Configuration the session ran with.
    pub config_name: String,
    /// Overall status.
    pub status: SyncStatus,
    /// Reason for a failed status.
    pub error: Option<String>,
    /// Per-source results by name.
    pub sources: BTreeMap<String, SourceReport>,
    /// Messages exchanged, resends included.
    pub messages_sent: u64,
    /// Number of resends.
    pub retries: u64,
    /// Wall clock time of the session.
    pub duration: Duration,
}

impl SyncReport {
    /// Creates an empty report.
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            ..Self::default()
        }
    }

    /// Returns the report of a source.
    pub fn source(&self, name: &str) -> Option<&SourceReport> {
        self.sources.get(name)
    }

    /// Returns true if the session and every source succeeded.
    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.sources.values().all(|s| s.status.is_success())
    }

    /// Returns the number of per-item errors over all sources.
    pub fn item_error_count(&self) -> usize {
        self.sources.values().map(|s| s.item_errors.len()).sum()
    }
}
