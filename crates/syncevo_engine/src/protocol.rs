//! The seam to the SyncML protocol engine.
//!
//! Encoding and decoding of SyncML messages is the engine's job. The driver
//! feeds it replies from the peer, sends what it asks to send and gives it
//! access to the local items through an [`ItemStore`].

use crate::error::SyncResult;
use crate::report::SyncStatus;
use std::fmt;
use syncevo_source::{ChangeSet, InsertItemResult, Luid, SourceError, SyncMode};
use syncevo_transport::TransportMessage;

/// Status of a single item operation, as reported to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    /// The item does not exist.
    NotFound,
    /// The operation failed for this item only.
    CommandFailed,
    /// The data store failed as a whole.
    DatastoreFailure,
}

impl ItemStatus {
    /// Returns the SyncML status code.
    pub fn code(&self) -> u16 {
        match self {
            ItemStatus::NotFound => 404,
            ItemStatus::CommandFailed => 500,
            ItemStatus::DatastoreFailure => 510,
        }
    }

    /// Classifies a source error.
    pub fn from_error(err: &SourceError) -> Self {
        match err {
            SourceError::NotFound(_) => ItemStatus::NotFound,
            err if err.is_storage_failure() => ItemStatus::DatastoreFailure,
            _ => ItemStatus::CommandFailed,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Session parameters handed to the engine.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Configuration name.
    pub config_name: String,
    /// Peer address.
    pub url: String,
    /// User name at the peer.
    pub username: String,
    /// Resolved password.
    pub password: String,
    /// MIME type of outgoing messages.
    pub content_type: String,
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInfo")
            .field("config_name", &self.config_name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// What one source contributes to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOffer {
    /// Source name.
    pub name: String,
    /// Mode the source runs in.
    pub mode: SyncMode,
    /// MIME type of the items.
    pub mime_type: String,
    /// Local changes to send.
    pub changes: ChangeSet,
}

/// Input for the next engine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepInput {
    /// First step of the session.
    Start,
    /// The peer answered the last message.
    Reply(TransportMessage),
    /// The last message was delivered, no reply was expected.
    Sent,
    /// The user asked to suspend. The engine should end the session so that
    /// it can be resumed.
    Suspend,
    /// The user asked to abort. The engine should end the session at once.
    Abort,
}

/// What the engine wants the driver to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCommand {
    /// Send a message to the peer.
    Send {
        /// The message.
        message: TransportMessage,
        /// Whether a reply is expected.
        expect_reply: bool,
    },
    /// The session is over.
    Done(SessionEnd),
}

/// How the engine ended the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// All sources were synchronized.
    Success,
    /// The session failed.
    Failed {
        /// Status to report.
        status: SyncStatus,
        /// Error description.
        message: String,
    },
    /// The session was suspended and can be resumed.
    Suspended,
    /// The session was aborted.
    Aborted,
}

impl SessionEnd {
    /// Returns the session status.
    pub fn status(&self) -> SyncStatus {
        match self {
            SessionEnd::Success => SyncStatus::Ok,
            SessionEnd::Failed { status, .. } => *status,
            SessionEnd::Suspended => SyncStatus::Suspended,
            SessionEnd::Aborted => SyncStatus::Aborted,
        }
    }
}

/// Access to local items for the engine.
///
/// Failures are reported as the status to send back for the item. They are
/// recorded by the store; the engine only has to relay them.
pub trait ItemStore {
    /// Reads an item to send it to the peer.
    ///
    /// # Errors
    ///
    /// Returns the status to report for the item.
    fn read_item(&mut self, source: &str, luid: &Luid) -> Result<Vec<u8>, ItemStatus>;

    /// Adds (`luid` is `None`) or updates an item received from the peer.
    ///
    /// # Errors
    ///
    /// Returns the status to report for the item.
    fn insert_item(
        &mut self,
        source: &str,
        luid: Option<&Luid>,
        data: &[u8],
    ) -> Result<InsertItemResult, ItemStatus>;

    /// Deletes an item on behalf of the peer.
    ///
    /// # Errors
    ///
    /// Returns the status to report for the item.
    fn delete_item(&mut self, source: &str, luid: &Luid) -> Result<(), ItemStatus>;
}

/// A SyncML protocol engine driven step by step.
pub trait ProtocolEngine {
    /// Prepares the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot start.
    fn begin(&mut self, session: &SessionInfo, offers: &[SourceOffer]) -> SyncResult<()>;

    /// Advances the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot continue, e.g. on a malformed
    /// reply.
    fn step(&mut self, input: StepInput, items: &mut dyn ItemStore) -> SyncResult<StepCommand>;
}

impl<E: ProtocolEngine + ?Sized> ProtocolEngine for Box<E> {
    fn begin(&mut self, session: &SessionInfo, offers: &[SourceOffer]) -> SyncResult<()> {
        (**self).begin(session, offers)
    }

    fn step(&mut self, input: StepInput, items: &mut dyn ItemStore) -> SyncResult<StepCommand> {
        (**self).step(input, items)
    }
}
