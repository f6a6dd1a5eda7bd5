//! The interface data store adapters implement.

use crate::error::SourceResult;
use crate::types::{Luid, Revision, RevisionMap};

/// How the backend handled an inserted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertState {
    /// The item was stored as requested.
    Okay,
    /// An item with the same identity already existed and was overwritten.
    Replaced,
    /// The item was merged into an existing one.
    Merged,
}

/// Outcome of [`SyncSource::insert_item`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertItemResult {
    /// LUID under which the item is stored now.
    pub luid: Luid,
    /// Revision of the stored item.
    pub revision: Revision,
    /// True if an existing item was updated instead of a new one created.
    pub was_update: bool,
    /// How the backend resolved the insert.
    pub state: InsertState,
}

impl InsertItemResult {
    /// Creates a result for an item stored as requested.
    pub fn new(luid: impl Into<Luid>, revision: impl Into<Revision>, was_update: bool) -> Self {
        Self {
            luid: luid.into(),
            revision: revision.into(),
            was_update,
            state: InsertState::Okay,
        }
    }

    /// Overrides the insert state.
    #[must_use]
    pub fn with_state(mut self, state: InsertState) -> Self {
        self.state = state;
        self
    }
}

/// A data store that items are synchronized with.
///
/// Backends only enumerate, read and write items. Change detection, ID
/// bookkeeping and revision persistence are layered on top by
/// [`crate::Source`].
///
/// Item content is opaque at this level. Operations on a closed source
/// return [`crate::SourceError::NotOpen`].
pub trait SyncSource: Send {
    /// Returns the name of the source, e.g. `addressbook`.
    fn name(&self) -> &str;

    /// Opens the data store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be accessed.
    fn open(&mut self) -> SourceResult<()>;

    /// Releases the data store. Closing a closed source is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if pending changes cannot be written.
    fn close(&mut self) -> SourceResult<()>;

    /// Enumerates every item with its current revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn list_all_items(&mut self) -> SourceResult<RevisionMap>;

    /// Reads the content of one item.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SourceError::NotFound`] for unknown items.
    fn read_item(&mut self, luid: &Luid) -> SourceResult<Vec<u8>>;

    /// Stores an item.
    ///
    /// Without `luid` a new item is created; with `luid` that item is
    /// updated. The backend may decide to store the item under another
    /// LUID than the one requested, the result says where it ended up.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be stored.
    fn insert_item(&mut self, luid: Option<&Luid>, data: &[u8]) -> SourceResult<InsertItemResult>;

    /// Removes an item.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SourceError::NotFound`] for unknown items.
    fn remove_item(&mut self, luid: &Luid) -> SourceResult<()>;

    /// Returns true if the store has no items.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn is_empty(&mut self) -> SourceResult<bool> {
        Ok(self.list_all_items()?.is_empty())
    }

    /// MIME type of the items, e.g. `text/vcard`.
    fn mime_type(&self) -> &str {
        "application/octet-stream"
    }
}

impl<S: SyncSource + ?Sized> SyncSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self) -> SourceResult<()> {
        (**self).open()
    }

    fn close(&mut self) -> SourceResult<()> {
        (**self).close()
    }

    fn list_all_items(&mut self) -> SourceResult<RevisionMap> {
        (**self).list_all_items()
    }

    fn read_item(&mut self, luid: &Luid) -> SourceResult<Vec<u8>> {
        (**self).read_item(luid)
    }

    fn insert_item(&mut self, luid: Option<&Luid>, data: &[u8]) -> SourceResult<InsertItemResult> {
        (**self).insert_item(luid, data)
    }

    fn remove_item(&mut self, luid: &Luid) -> SourceResult<()> {
        (**self).remove_item(luid)
    }

    fn is_empty(&mut self) -> SourceResult<bool> {
        (**self).is_empty()
    }

    fn mime_type(&self) -> &str {
        (**self).mime_type()
    }
}
